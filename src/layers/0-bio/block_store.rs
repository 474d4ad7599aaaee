// SPDX-License-Identifier: MPL-2.0

use super::BlockId;
use crate::prelude::*;

/// A key-addressed store of opaque byte blocks.
///
/// # Thread safety
///
/// A `BlockStore` is a data structure of interior mutability. It is ok
/// to perform I/O on a `BlockStore` concurrently from multiple threads;
/// individual operations on one block are atomic.
///
/// # Contract
///
/// Stored bytes round-trip unchanged; the store never interprets block
/// contents. Decorator stores (encryption, integrity) implement the same
/// trait and shrink the usable block size, which is why
/// [`block_size_from_physical_block_size`] exists.
///
/// [`block_size_from_physical_block_size`]: BlockStore::block_size_from_physical_block_size
pub trait BlockStore: Send + Sync {
    /// Stores a new block under `id`.
    ///
    /// Returns `false` if a block with this id already exists; the caller
    /// retries with a fresh random id.
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool>;

    /// Loads the block with the given id, or `None` if it does not exist.
    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>>;

    /// Overwrites the block with the given id, creating it if necessary.
    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()>;

    /// Removes the block with the given id.
    ///
    /// Returns `false` if no such block existed.
    fn remove(&self, id: &BlockId) -> Result<bool>;

    /// Returns the number of stored blocks.
    fn num_blocks(&self) -> Result<u64>;

    /// Estimates how many more bytes the backend can hold.
    fn estimate_num_free_bytes(&self) -> Result<u64>;

    /// Returns the number of usable payload bytes per block, given the
    /// physical size of a block on the lowest layer.
    ///
    /// Decorators subtract their per-block overhead; the raw backends
    /// return `physical_block_size` unchanged.
    fn block_size_from_physical_block_size(&self, physical_block_size: u64) -> Result<u64>;

    /// Invokes `callback` for the id of every stored block, in no
    /// particular order.
    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId) -> Result<()>) -> Result<()>;

    /// Stores `data` under a fresh random id and returns the id.
    fn create(&self, data: &[u8]) -> Result<BlockId> {
        loop {
            let id = BlockId::random();
            if self.try_create(&id, data)? {
                return Ok(id);
            }
            // 128-bit collision; practically unreachable but handled.
            debug!("block id collision on create, retrying: {}", id);
        }
    }
}

macro_rules! forward_block_store_impl {
    ($type:ty) => {
        impl<B: BlockStore + ?Sized> BlockStore for $type {
            fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
                (**self).try_create(id, data)
            }
            fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
                (**self).load(id)
            }
            fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
                (**self).store(id, data)
            }
            fn remove(&self, id: &BlockId) -> Result<bool> {
                (**self).remove(id)
            }
            fn num_blocks(&self) -> Result<u64> {
                (**self).num_blocks()
            }
            fn estimate_num_free_bytes(&self) -> Result<u64> {
                (**self).estimate_num_free_bytes()
            }
            fn block_size_from_physical_block_size(&self, physical_block_size: u64) -> Result<u64> {
                (**self).block_size_from_physical_block_size(physical_block_size)
            }
            fn for_each_block(
                &self,
                callback: &mut dyn FnMut(&BlockId) -> Result<()>,
            ) -> Result<()> {
                (**self).for_each_block(callback)
            }
        }
    };
}

forward_block_store_impl!(&B);
forward_block_store_impl!(Box<B>);
forward_block_store_impl!(std::sync::Arc<B>);
