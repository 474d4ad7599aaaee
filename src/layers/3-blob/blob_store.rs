// SPDX-License-Identifier: MPL-2.0

use super::node::NodeLayout;
use super::node_store::NodeStore;
use super::tree::DataTree;
use crate::layers::bio::{BlockId, BlockStore};
use crate::prelude::*;

/// Assembles fixed-size blocks into variable-length blobs.
///
/// Each blob is one node tree; the blob id is the tree's root block id,
/// which stays stable for the blob's whole lifetime.
#[derive(Debug)]
pub struct BlobStoreOnBlocks<B> {
    node_store: Arc<NodeStore<B>>,
}

impl<B: BlockStore> BlobStoreOnBlocks<B> {
    /// Creates a blob store on `store`, whose blocks are
    /// `physical_block_size_bytes` large on the lowest layer.
    pub fn new(store: B, physical_block_size_bytes: u32) -> Result<Self> {
        let usable = store.block_size_from_physical_block_size(physical_block_size_bytes as u64)?;
        let layout = NodeLayout::new(u32::try_from(usable).map_err(|_| {
            Error::with_msg(BadConfig, "physical block size out of range")
        })?)?;
        Ok(Self {
            node_store: Arc::new(NodeStore::new(store, layout)),
        })
    }

    /// Creates a new empty blob.
    pub fn create(&self) -> Result<Blob<B>> {
        let root = self.node_store.create_new_leaf_node(&[])?;
        Ok(Blob {
            tree: DataTree::new(self.node_store.clone(), *root.block_id()),
        })
    }

    /// Loads the blob with the given id, or `None` if it does not exist.
    pub fn load(&self, id: &BlockId) -> Result<Option<Blob<B>>> {
        match self.node_store.load(id)? {
            Some(_root) => Ok(Some(Blob {
                tree: DataTree::new(self.node_store.clone(), *id),
            })),
            None => Ok(None),
        }
    }

    /// Removes a loaded blob and all its nodes.
    pub fn remove(&self, blob: Blob<B>) -> Result<()> {
        blob.tree.remove_all_nodes()
    }

    /// Removes the blob with the given id and all its nodes.
    pub fn remove_by_id(&self, id: &BlockId) -> Result<()> {
        match self.load(id)? {
            Some(blob) => self.remove(blob),
            None => return_errno_with_msg!(NotFound, "tried to remove a blob that does not exist"),
        }
    }

    /// Payload bytes per leaf, for size estimates by upper layers.
    pub fn virtual_block_size_bytes(&self) -> u32 {
        self.node_store.layout().max_bytes_per_leaf()
    }

    pub fn num_nodes(&self) -> Result<u64> {
        self.node_store.num_nodes()
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> Result<u64> {
        self.node_store.estimate_space_for_num_nodes_left()
    }

    /// Writes all pending mutations through to the block store.
    pub fn flush(&self) -> Result<()> {
        self.node_store.flush()
    }
}

/// A variable-length byte sequence with random access, backed by a node
/// tree.
///
/// Not thread-safe; callers serialize access per blob.
#[derive(Debug)]
pub struct Blob<B> {
    tree: DataTree<B>,
}

impl<B: BlockStore> Blob<B> {
    /// The blob's id: the root node's block id. Stable across resizes
    /// and writes.
    pub fn id(&self) -> &BlockId {
        self.tree.root_block_id()
    }

    pub fn num_bytes(&mut self) -> Result<u64> {
        self.tree.num_bytes()
    }

    /// Grows (zero-filled) or shrinks (truncating) to exactly
    /// `new_num_bytes`.
    pub fn resize(&mut self, new_num_bytes: u64) -> Result<()> {
        self.tree.resize_num_bytes(new_num_bytes)
    }

    /// Reads exactly `target.len()` bytes at `offset`; fails if the
    /// range leaves the blob.
    pub fn read(&mut self, offset: u64, target: &mut [u8]) -> Result<()> {
        self.tree.read_bytes(offset, target)
    }

    /// Reads what is available at `offset`, returning the count.
    pub fn try_read(&mut self, offset: u64, target: &mut [u8]) -> Result<usize> {
        self.tree.try_read_bytes(offset, target)
    }

    /// Reads the whole blob.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let num_bytes = self.num_bytes()?;
        let mut data = vec![
            0;
            usize::try_from(num_bytes)
                .map_err(|_| Error::with_msg(InvalidArgs, "blob too large for memory"))?
        ];
        self.read(0, &mut data)?;
        Ok(data)
    }

    /// Writes at `offset`, implicitly growing the blob if the write
    /// goes past the end.
    pub fn write(&mut self, offset: u64, source: &[u8]) -> Result<()> {
        self.tree.write_bytes(offset, source)
    }

    /// Writes all pending mutations of this blob's tree through to the
    /// block store.
    pub fn flush(&mut self) -> Result<()> {
        self.tree.flush()
    }
}
