// SPDX-License-Identifier: MPL-2.0

use super::node::{InnerNode, LeafNode, Node};
use super::node_store::NodeStore;
use crate::layers::bio::{BlockId, BlockStore};
use crate::prelude::*;
use crate::util::ceil_div;

/// A blob's node tree: balanced, fixed-fanout, left-max-data.
///
/// Invariants:
/// * all leaves sit at the same depth;
/// * every leaf except the rightmost is full, every inner node except
///   those on the rightmost root-to-leaf path is full;
/// * the root's block id never changes. Depth changes move node
///   *content* in and out of the root block instead of replacing the
///   root node, so the id stays stable across any sequence of resizes.
///
/// All operations cost O(depth) block accesses per touched leaf, and
/// the leaf count is computed by walking only the rightmost path.
///
/// A `DataTree` is not thread-safe; the blob layers above serialize
/// access per blob.
#[derive(Debug)]
pub struct DataTree<B> {
    node_store: Arc<NodeStore<B>>,
    root_id: BlockId,
    num_leaves_cache: Option<u64>,
}

impl<B: BlockStore> DataTree<B> {
    pub(super) fn new(node_store: Arc<NodeStore<B>>, root_id: BlockId) -> Self {
        Self {
            node_store,
            root_id,
            num_leaves_cache: None,
        }
    }

    pub fn root_block_id(&self) -> &BlockId {
        &self.root_id
    }

    fn max_bytes_per_leaf(&self) -> u64 {
        self.node_store.layout().max_bytes_per_leaf() as u64
    }

    fn max_children(&self) -> u64 {
        self.node_store.layout().max_children_per_inner_node() as u64
    }

    fn load_node(&self, id: &BlockId) -> Result<Node> {
        match self.node_store.load(id)? {
            Some(node) => Ok(node),
            None => {
                return_errno_with_msg!(CorruptedStorage, "a referenced tree node does not exist")
            }
        }
    }

    fn load_root(&self) -> Result<Node> {
        self.load_node(&self.root_id)
    }

    /// Number of inner-node levels above the leaves; 0 for a tree whose
    /// root is a leaf. Walks the rightmost path.
    pub fn depth(&self) -> Result<u8> {
        let mut depth = 0u8;
        let mut node = self.load_root()?;
        while let Node::Inner(inner) = node {
            depth += 1;
            node = self.load_node(&inner.last_child()?)?;
        }
        Ok(depth)
    }

    /// Number of leaves, cached. The non-cached computation walks only
    /// the rightmost root-to-leaf path, which is correct because every
    /// subtree left of it is complete.
    pub fn num_leaves(&mut self) -> Result<u64> {
        if let Some(cached) = self.num_leaves_cache {
            return Ok(cached);
        }
        let computed = self.force_compute_num_leaves()?;
        Ok(computed)
    }

    /// Recomputes the leaf count, ignoring the cache.
    pub fn force_compute_num_leaves(&mut self) -> Result<u64> {
        let root = self.load_root()?;
        let (num_leaves, _depth) = self.count_leaves_in(root)?;
        self.num_leaves_cache = Some(num_leaves);
        Ok(num_leaves)
    }

    fn count_leaves_in(&self, node: Node) -> Result<(u64, u8)> {
        match node {
            Node::Leaf(_) => Ok((1, 0)),
            Node::Inner(inner) => {
                let num_children = inner.num_children() as u64;
                let last_child = self.load_node(&inner.last_child()?)?;
                let (leaves_in_last, child_depth) = self.count_leaves_in(last_child)?;
                let leaves_per_full_child = self.max_children().pow(child_depth as u32);
                Ok((
                    (num_children - 1) * leaves_per_full_child + leaves_in_last,
                    child_depth + 1,
                ))
            }
        }
    }

    /// Total payload bytes in the blob.
    pub fn num_bytes(&mut self) -> Result<u64> {
        let num_leaves = self.num_leaves()?;
        let depth = self.depth()?;
        let last_leaf = self.load_leaf(depth, num_leaves - 1)?;
        Ok((num_leaves - 1) * self.max_bytes_per_leaf() + last_leaf.num_bytes() as u64)
    }

    /// Loads the leaf with the given index by arithmetic descent.
    fn load_leaf(&self, depth: u8, leaf_index: u64) -> Result<LeafNode> {
        let k = self.max_children();
        let mut node = self.load_root()?;
        for level in (0..depth).rev() {
            let inner = node.into_inner_node()?;
            let child_index = (leaf_index / k.pow(level as u32)) % k;
            if child_index >= inner.num_children() as u64 {
                return_errno_with_msg!(CorruptedStorage, "leaf index beyond the stored tree");
            }
            node = self.load_node(&inner.child(child_index as u32)?)?;
        }
        node.into_leaf_node()
    }

    /// Traverses the leaves `[begin_index, end_index)`, growing the tree
    /// first if `end_index` is beyond the current leaf count.
    ///
    /// This is the only growth primitive: the tree decides *where* new
    /// leaves go (always extending the rightmost path, keeping
    /// left-max-data), the caller decides *what* goes into them via
    /// `on_new_leaf`. New non-rightmost leaves must be produced full;
    /// the new rightmost leaf may be shorter.
    ///
    /// `on_existing_leaf` runs for every pre-existing leaf in range and
    /// may mutate it through the handle.
    pub fn traverse_leaves(
        &mut self,
        begin_index: u64,
        end_index: u64,
        on_existing_leaf: &mut dyn FnMut(u64, bool, &mut LeafHandle<'_>) -> Result<()>,
        on_new_leaf: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
    ) -> Result<()> {
        if begin_index > end_index {
            return_errno_with_msg!(InvalidArgs, "traversal range is reversed");
        }
        let current_num_leaves = self.num_leaves()?;
        let total_num_leaves = current_num_leaves.max(end_index);

        if end_index > current_num_leaves {
            self.grow(current_num_leaves, end_index, on_new_leaf)?;
        }

        let last_existing = end_index.min(current_num_leaves);
        if begin_index < last_existing {
            let depth = self.depth()?;
            for index in begin_index..last_existing {
                let mut leaf = self.load_leaf(depth, index)?;
                let mut handle = LeafHandle {
                    leaf: &mut leaf,
                    dirty: false,
                };
                on_existing_leaf(index, index == total_num_leaves - 1, &mut handle)?;
                let dirty = handle.dirty;
                if dirty {
                    self.node_store.write_leaf(&leaf)?;
                }
            }
        }
        Ok(())
    }

    /// Grows the tree from `current` to `end` leaves.
    fn grow(
        &mut self,
        current: u64,
        end: u64,
        on_new_leaf: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
    ) -> Result<()> {
        let max_leaf_bytes = self.max_bytes_per_leaf() as u32;
        let mut depth = self.depth()?;

        // The old rightmost leaf stops being rightmost; left-max-data
        // requires it to be full.
        let mut old_last_leaf = self.load_leaf(depth, current - 1)?;
        if old_last_leaf.num_bytes() < max_leaf_bytes {
            old_last_leaf.resize(max_leaf_bytes)?;
            self.node_store.write_leaf(&old_last_leaf)?;
        }

        while self.node_store.layout().max_leaves_per_tree(depth) < end {
            self.increase_depth()?;
            depth += 1;
        }

        for index in current..end {
            let data = on_new_leaf(index)?;
            if data.len() > max_leaf_bytes as usize {
                return_errno_with_msg!(UsageError, "new leaf data beyond the leaf capacity");
            }
            if index < end - 1 && data.len() != max_leaf_bytes as usize {
                return_errno_with_msg!(UsageError, "only the rightmost new leaf may be short");
            }
            self.append_leaf(depth, index, &data)?;
        }
        self.num_leaves_cache = Some(end);
        Ok(())
    }

    /// Adds one level: the root's content moves into a fresh block that
    /// becomes the single child of the root block, whose bytes are
    /// overwritten with a new inner node. The root id is untouched.
    fn increase_depth(&mut self) -> Result<()> {
        let root = self.load_root()?;
        let copied_id = self.node_store.create_node_copy(&root)?;
        let new_root = InnerNode::new(self.root_id, &[copied_id], self.node_store.layout());
        self.node_store.write_inner(&new_root)
    }

    /// Appends the leaf with index `index` (== current leaf count) along
    /// the rightmost path. The tree already has capacity for it.
    fn append_leaf(&mut self, depth: u8, index: u64, data: &[u8]) -> Result<()> {
        debug_assert!(depth >= 1, "a capacity-checked append never sees a leaf root");
        let k = self.max_children();
        let mut inner = self.load_root()?.into_inner_node()?;
        let mut level = depth;
        loop {
            let leaves_per_child = k.pow(level as u32 - 1);
            let child_index = (index / leaves_per_child) % k;
            let num_children = inner.num_children() as u64;
            if child_index == num_children {
                // Attach a fresh chain down to the new leaf here.
                let chain_id = self.create_chain(level - 1, data)?;
                inner.add_child(&chain_id)?;
                return self.node_store.write_inner(&inner);
            }
            if child_index == num_children - 1 && level > 1 {
                // Descend into the still-growing rightmost subtree.
                inner = self
                    .load_node(&inner.child(child_index as u32)?)?
                    .into_inner_node()?;
                level -= 1;
                continue;
            }
            return_errno_with_msg!(CorruptedStorage, "tree shape violates left-max-data");
        }
    }

    /// Creates a leftmost chain of `levels` inner nodes above a new leaf
    /// holding `data`; returns the chain's top block id.
    fn create_chain(&self, levels: u8, data: &[u8]) -> Result<BlockId> {
        let leaf = self.node_store.create_new_leaf_node(data)?;
        let mut top = *leaf.block_id();
        for _ in 0..levels {
            let inner = self.node_store.create_new_inner_node(&[top])?;
            top = *inner.block_id();
        }
        Ok(top)
    }

    /// Resizes the blob to `new_num_bytes`, zero-filling growth and
    /// pruning subtrees on shrink.
    pub fn resize_num_bytes(&mut self, new_num_bytes: u64) -> Result<()> {
        let max_leaf_bytes = self.max_bytes_per_leaf();
        let new_num_leaves = 1.max(ceil_div(new_num_bytes, max_leaf_bytes));
        let new_last_leaf_size = (new_num_bytes - (new_num_leaves - 1) * max_leaf_bytes) as u32;
        let current = self.num_leaves()?;

        if new_num_leaves > current {
            self.traverse_leaves(
                new_num_leaves,
                new_num_leaves,
                &mut |_, _, _| Ok(()),
                &mut |index| {
                    if index == new_num_leaves - 1 {
                        Ok(vec![0; new_last_leaf_size as usize])
                    } else {
                        Ok(vec![0; max_leaf_bytes as usize])
                    }
                },
            )?;
        } else {
            if new_num_leaves < current {
                self.shrink_to(new_num_leaves)?;
            }
            let depth = self.depth()?;
            let mut last_leaf = self.load_leaf(depth, new_num_leaves - 1)?;
            if last_leaf.num_bytes() != new_last_leaf_size {
                last_leaf.resize(new_last_leaf_size)?;
                self.node_store.write_leaf(&last_leaf)?;
            }
        }
        Ok(())
    }

    /// Prunes leaves `[new_num_leaves, current)` from the right and
    /// collapses the root downward while it has a single child.
    fn shrink_to(&mut self, new_num_leaves: u64) -> Result<()> {
        debug_assert!(new_num_leaves >= 1);
        let depth = self.depth()?;
        if depth > 0 {
            let root_id = self.root_id;
            self.prune(&root_id, depth, new_num_leaves)?;
        }

        loop {
            let Node::Inner(inner) = self.load_root()? else {
                break;
            };
            if inner.num_children() > 1 {
                break;
            }
            // Pull the single child's content up into the root block,
            // lowering the depth while keeping the root id.
            let child_id = inner.child(0)?;
            let child = self.load_node(&child_id)?;
            self.node_store.overwrite_node_bytes(&self.root_id, &child)?;
            self.node_store.remove(&child_id)?;
        }
        self.num_leaves_cache = Some(new_num_leaves);
        Ok(())
    }

    /// Prunes the subtree rooted at `id` (an inner node at `level` ≥ 1)
    /// down to its first `keep_leaves` leaves.
    fn prune(&mut self, id: &BlockId, level: u8, keep_leaves: u64) -> Result<()> {
        debug_assert!(keep_leaves >= 1);
        let inner = self.load_node(id)?.into_inner_node()?;
        let leaves_per_child = self.max_children().pow(level as u32 - 1);
        let keep_children = ceil_div(keep_leaves, leaves_per_child);
        let num_children = inner.num_children() as u64;

        if keep_children < num_children {
            let dropped: Vec<BlockId> = (keep_children..num_children)
                .map(|i| inner.child(i as u32))
                .collect::<Result<_>>()?;
            for child_id in dropped {
                self.remove_subtree(&child_id)?;
            }
            let mut inner = inner;
            inner.shrink_num_children(keep_children as u32)?;
            self.node_store.write_inner(&inner)?;

            let remainder = keep_leaves - (keep_children - 1) * leaves_per_child;
            if level > 1 && remainder < leaves_per_child {
                let last_kept = self.load_node(id)?.into_inner_node()?.last_child()?;
                self.prune(&last_kept, level - 1, remainder)?;
            }
        } else {
            let remainder = keep_leaves - (keep_children - 1) * leaves_per_child;
            if level > 1 && remainder < leaves_per_child {
                self.prune(&inner.last_child()?, level - 1, remainder)?;
            }
        }
        Ok(())
    }

    /// Removes the whole subtree rooted at `id`, bottom-up.
    fn remove_subtree(&self, id: &BlockId) -> Result<()> {
        if let Node::Inner(inner) = self.load_node(id)? {
            for i in 0..inner.num_children() {
                self.remove_subtree(&inner.child(i)?)?;
            }
        }
        self.node_store.remove(id)
    }

    /// Removes all of the tree's nodes, consuming the tree.
    pub fn remove_all_nodes(self) -> Result<()> {
        self.remove_subtree(&self.root_id)
    }

    /// Reads exactly `target.len()` bytes at `offset`; the range must be
    /// within the blob.
    pub fn read_bytes(&mut self, offset: u64, target: &mut [u8]) -> Result<()> {
        let num_bytes = self.num_bytes()?;
        let end = offset
            .checked_add(target.len() as u64)
            .ok_or(Error::with_msg(InvalidArgs, "read range overflows"))?;
        if end > num_bytes {
            return_errno_with_msg!(InvalidArgs, "read past the end of the blob");
        }
        self.do_read(offset, target)
    }

    /// Reads as many bytes as are available at `offset`, up to
    /// `target.len()`; returns how many were read.
    pub fn try_read_bytes(&mut self, offset: u64, target: &mut [u8]) -> Result<usize> {
        let num_bytes = self.num_bytes()?;
        let readable = num_bytes.saturating_sub(offset).min(target.len() as u64) as usize;
        self.do_read(offset, &mut target[..readable])?;
        Ok(readable)
    }

    fn do_read(&mut self, offset: u64, target: &mut [u8]) -> Result<()> {
        if target.is_empty() {
            return Ok(());
        }
        let max_leaf_bytes = self.max_bytes_per_leaf();
        let depth = self.depth()?;
        let first_leaf = offset / max_leaf_bytes;
        let end_leaf = ceil_div(offset + target.len() as u64, max_leaf_bytes);
        let mut written = 0usize;
        for index in first_leaf..end_leaf {
            let leaf = self.load_leaf(depth, index)?;
            let leaf_offset = if index == first_leaf {
                (offset % max_leaf_bytes) as usize
            } else {
                0
            };
            let available = (leaf.num_bytes() as usize).saturating_sub(leaf_offset);
            let num = (target.len() - written).min(available);
            if num == 0 {
                return_errno_with_msg!(CorruptedStorage, "leaf is shorter than the blob size");
            }
            target[written..written + num]
                .copy_from_slice(&leaf.data()[leaf_offset..leaf_offset + num]);
            written += num;
        }
        debug_assert_eq!(written, target.len());
        Ok(())
    }

    /// Writes `source` at `offset`, growing the blob if the write goes
    /// past its current end.
    pub fn write_bytes(&mut self, offset: u64, source: &[u8]) -> Result<()> {
        if source.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(source.len() as u64)
            .ok_or(Error::with_msg(InvalidArgs, "write range overflows"))?;
        if end > self.num_bytes()? {
            self.resize_num_bytes(end)?;
        }

        let max_leaf_bytes = self.max_bytes_per_leaf();
        let depth = self.depth()?;
        let first_leaf = offset / max_leaf_bytes;
        let end_leaf = ceil_div(end, max_leaf_bytes);
        let mut read_so_far = 0usize;
        for index in first_leaf..end_leaf {
            let mut leaf = self.load_leaf(depth, index)?;
            let leaf_offset = if index == first_leaf {
                (offset % max_leaf_bytes) as u32
            } else {
                0
            };
            let num = (source.len() - read_so_far).min((leaf.num_bytes() - leaf_offset) as usize);
            leaf.write(leaf_offset, &source[read_so_far..read_so_far + num])?;
            self.node_store.write_leaf(&leaf)?;
            read_so_far += num;
        }
        debug_assert_eq!(read_so_far, source.len());
        Ok(())
    }

    /// Writes all pending node mutations through to the block store.
    pub fn flush(&mut self) -> Result<()> {
        self.node_store.flush()
    }
}

/// A handle to one leaf during traversal. Mutations through the handle
/// mark the leaf for write-back.
pub struct LeafHandle<'a> {
    leaf: &'a mut LeafNode,
    dirty: bool,
}

impl LeafHandle<'_> {
    pub fn num_bytes(&self) -> u32 {
        self.leaf.num_bytes()
    }

    pub fn max_bytes(&self) -> u32 {
        self.leaf.max_bytes()
    }

    pub fn data(&self) -> &[u8] {
        self.leaf.data()
    }

    pub fn resize(&mut self, new_num_bytes: u32) -> Result<()> {
        self.leaf.resize(new_num_bytes)?;
        self.dirty = true;
        Ok(())
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.leaf.write(offset, data)?;
        self.dirty = true;
        Ok(())
    }
}
