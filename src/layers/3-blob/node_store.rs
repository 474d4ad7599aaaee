// SPDX-License-Identifier: MPL-2.0

use std::num::NonZeroUsize;

use lru::LruCache;

use super::node::{InnerNode, LeafNode, Node, NodeLayout};
use crate::layers::bio::{BlockId, BlockStore};
use crate::os::Mutex;
use crate::prelude::*;

/// Loads and stores tree nodes on a block store.
///
/// Keeps a small LRU cache of node bytes so that repeated descents
/// through the same tree path do not re-read (and re-decrypt) the same
/// blocks. The cache is write-back: mutated nodes are kept dirty in the
/// cache and written to the block store on eviction or [`flush`], which
/// coalesces repeated writes to the same node.
///
/// [`flush`]: NodeStore::flush
#[derive(Debug)]
pub struct NodeStore<B> {
    store: B,
    layout: NodeLayout,
    cache: Mutex<LruCache<BlockId, CachedNode>>,
}

#[derive(Debug)]
struct CachedNode {
    bytes: Vec<u8>,
    dirty: bool,
}

/// Upper bound on cached nodes, same value as the block cache of the
/// kernel this is modeled after.
const MAX_CACHED_NODES: usize = 16;

impl<B: BlockStore> NodeStore<B> {
    pub fn new(store: B, layout: NodeLayout) -> Self {
        Self {
            store,
            layout,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_NODES).expect("cache size is nonzero"),
            )),
        }
    }

    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    /// Loads the node with the given id.
    pub fn load(&self, id: &BlockId) -> Result<Option<Node>> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(id) {
            return Ok(Some(Node::parse(*id, cached.bytes.clone(), self.layout)?));
        }
        let Some(bytes) = self.store.load(id)? else {
            return Ok(None);
        };
        let node = Node::parse(*id, bytes.clone(), self.layout)?;
        Self::insert(&mut cache, &self.store, *id, CachedNode { bytes, dirty: false })?;
        Ok(Some(node))
    }

    /// Allocates a new leaf node holding `data` under a fresh block id.
    pub fn create_new_leaf_node(&self, data: &[u8]) -> Result<LeafNode> {
        if data.len() > self.layout.max_bytes_per_leaf() as usize {
            return_errno_with_msg!(UsageError, "leaf data beyond the layout maximum");
        }
        let leaf = LeafNode::new(BlockId::from_bytes([0; BlockId::BINARY_LEN]), data, self.layout);
        let id = self.store.create(leaf.raw_bytes_ref())?;
        let leaf = leaf.with_block_id(id);
        self.cache_clean(id, leaf.raw_bytes_ref().to_vec())?;
        Ok(leaf)
    }

    /// Allocates a new inner node with the given children under a fresh
    /// block id.
    pub fn create_new_inner_node(&self, children: &[BlockId]) -> Result<InnerNode> {
        if children.is_empty() || children.len() > self.layout.max_children_per_inner_node() as usize
        {
            return_errno_with_msg!(UsageError, "invalid child count for an inner node");
        }
        let inner =
            InnerNode::new(BlockId::from_bytes([0; BlockId::BINARY_LEN]), children, self.layout);
        let id = self.store.create(inner.raw_bytes_ref())?;
        let inner = inner.with_block_id(id);
        self.cache_clean(id, inner.raw_bytes_ref().to_vec())?;
        Ok(inner)
    }

    /// Allocates a new block holding a byte-for-byte copy of `node`.
    ///
    /// Used when the tree changes depth: the root's content moves into a
    /// fresh block while the root id stays put.
    pub fn create_node_copy(&self, node: &Node) -> Result<BlockId> {
        let bytes = node.raw_bytes().to_vec();
        let id = self.store.create(&bytes)?;
        self.cache_clean(id, bytes)?;
        Ok(id)
    }

    /// Queues the mutated leaf for write-back.
    pub fn write_leaf(&self, leaf: &LeafNode) -> Result<()> {
        self.cache_dirty(*leaf.block_id(), leaf.raw_bytes_ref().to_vec())
    }

    /// Queues the mutated inner node for write-back.
    pub fn write_inner(&self, inner: &InnerNode) -> Result<()> {
        self.cache_dirty(*inner.block_id(), inner.raw_bytes_ref().to_vec())
    }

    /// Overwrites the block at `id` with another node's bytes, keeping
    /// the id. This is the in-place replacement primitive behind
    /// root-preserving depth changes.
    pub fn overwrite_node_bytes(&self, id: &BlockId, node: &Node) -> Result<()> {
        self.cache_dirty(*id, node.raw_bytes().to_vec())
    }

    /// Removes the node's block.
    pub fn remove(&self, id: &BlockId) -> Result<()> {
        self.cache.lock().pop(id);
        if !self.store.remove(id)? {
            return_errno_with_msg!(NotFound, "tried to remove a node that does not exist");
        }
        Ok(())
    }

    /// Writes all dirty cached nodes through to the block store.
    pub fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        for (id, cached) in cache.iter_mut() {
            if cached.dirty {
                self.store.store(id, &cached.bytes)?;
                cached.dirty = false;
            }
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> Result<u64> {
        self.store.num_blocks()
    }

    pub fn estimate_space_for_num_nodes_left(&self) -> Result<u64> {
        Ok(self.store.estimate_num_free_bytes()? / self.layout.block_size_bytes() as u64)
    }

    fn cache_clean(&self, id: BlockId, bytes: Vec<u8>) -> Result<()> {
        let mut cache = self.cache.lock();
        Self::insert(&mut cache, &self.store, id, CachedNode { bytes, dirty: false })
    }

    fn cache_dirty(&self, id: BlockId, bytes: Vec<u8>) -> Result<()> {
        let mut cache = self.cache.lock();
        Self::insert(&mut cache, &self.store, id, CachedNode { bytes, dirty: true })
    }

    /// Inserts into the cache, evicting (and writing back) old entries
    /// if it is at capacity.
    fn insert(
        cache: &mut LruCache<BlockId, CachedNode>,
        store: &B,
        id: BlockId,
        node: CachedNode,
    ) -> Result<()> {
        if cache.len() >= MAX_CACHED_NODES && !cache.contains(&id) {
            for _ in 0..MAX_CACHED_NODES / 2 {
                let Some((evicted_id, evicted)) = cache.pop_lru() else {
                    break;
                };
                if evicted.dirty {
                    store.store(&evicted_id, &evicted.bytes)?;
                }
            }
        }
        // If the id was already cached, the new bytes supersede the old.
        cache.put(id, node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::InMemoryBlockStore;

    fn node_store() -> NodeStore<InMemoryBlockStore> {
        // K = 4, L = 64.
        NodeStore::new(InMemoryBlockStore::new(), NodeLayout::new(72).unwrap())
    }

    #[test]
    fn created_leaf_is_loadable() {
        let store = node_store();
        let leaf = store.create_new_leaf_node(b"leaf payload").unwrap();
        let loaded = store.load(leaf.block_id()).unwrap().unwrap();
        let loaded = loaded.into_leaf_node().unwrap();
        assert_eq!(loaded.data(), b"leaf payload");
    }

    #[test]
    fn created_inner_node_is_loadable() {
        let store = node_store();
        let leaf1 = store.create_new_leaf_node(b"one").unwrap();
        let leaf2 = store.create_new_leaf_node(b"two").unwrap();
        let inner = store
            .create_new_inner_node(&[*leaf1.block_id(), *leaf2.block_id()])
            .unwrap();

        let loaded = store.load(inner.block_id()).unwrap().unwrap();
        let loaded = loaded.into_inner_node().unwrap();
        assert_eq!(loaded.num_children(), 2);
        assert_eq!(loaded.child(0).unwrap(), *leaf1.block_id());
        assert_eq!(loaded.child(1).unwrap(), *leaf2.block_id());
    }

    #[test]
    fn mutations_survive_flush_and_eviction() {
        let store = node_store();
        let mut leaf = store.create_new_leaf_node(b"before").unwrap();
        leaf.resize(5).unwrap();
        leaf.write(0, b"after").unwrap();
        store.write_leaf(&leaf).unwrap();
        store.flush().unwrap();

        // Overflow the cache so the leaf is long evicted.
        for _ in 0..2 * MAX_CACHED_NODES {
            store.create_new_leaf_node(b"filler").unwrap();
        }

        let loaded = store.load(leaf.block_id()).unwrap().unwrap();
        assert_eq!(loaded.into_leaf_node().unwrap().data(), b"after");
    }

    #[test]
    fn dirty_nodes_are_written_on_eviction() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = NodeStore::new(base.clone(), NodeLayout::new(72).unwrap());
        let mut leaf = store.create_new_leaf_node(b"x").unwrap();
        leaf.resize(1).unwrap();
        leaf.write(0, b"y").unwrap();
        store.write_leaf(&leaf).unwrap();

        for _ in 0..2 * MAX_CACHED_NODES {
            store.create_new_leaf_node(b"filler").unwrap();
        }

        // Bypass the cache: the backend must hold the new bytes.
        let raw = base.load(leaf.block_id()).unwrap().unwrap();
        let node = Node::parse(*leaf.block_id(), raw, store.layout()).unwrap();
        assert_eq!(node.into_leaf_node().unwrap().data(), b"y");
    }

    #[test]
    fn overwrite_node_bytes_keeps_the_id() {
        let store = node_store();
        let leaf = store.create_new_leaf_node(b"the root").unwrap();
        let root_id = *leaf.block_id();

        let other = store.create_new_leaf_node(b"replacement").unwrap();
        let other_node = store.load(other.block_id()).unwrap().unwrap();
        store.overwrite_node_bytes(&root_id, &other_node).unwrap();

        let loaded = store.load(&root_id).unwrap().unwrap();
        assert_eq!(loaded.into_leaf_node().unwrap().data(), b"replacement");
    }

    #[test]
    fn remove_missing_node_fails() {
        let store = node_store();
        let err = store.remove(&BlockId::random()).unwrap_err();
        assert_eq!(err.errno(), NotFound);
    }

    #[test]
    fn remove_discards_cached_state() {
        let store = node_store();
        let leaf = store.create_new_leaf_node(b"gone soon").unwrap();
        store.remove(leaf.block_id()).unwrap();
        assert!(store.load(leaf.block_id()).unwrap().is_none());
    }
}
