// SPDX-License-Identifier: MPL-2.0

use super::{BlockId, BlockStore};
use crate::os::{HashMap, Mutex};
use crate::prelude::*;

/// A block store keeping all blocks in memory. Used by tests and as a
/// cheap scratch backend; contents are lost on drop.
pub struct InMemoryBlockStore {
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for InMemoryBlockStore {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        let mut blocks = self.blocks.lock();
        if blocks.contains_key(id) {
            return Ok(false);
        }
        blocks.insert(*id, data.to_vec());
        Ok(true)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.lock().get(id).cloned())
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        self.blocks.lock().insert(*id, data.to_vec());
        Ok(())
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        Ok(self.blocks.lock().remove(id).is_some())
    }

    fn num_blocks(&self) -> Result<u64> {
        Ok(self.blocks.lock().len() as u64)
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        Ok(u64::MAX)
    }

    fn block_size_from_physical_block_size(&self, physical_block_size: u64) -> Result<u64> {
        Ok(physical_block_size)
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId) -> Result<()>) -> Result<()> {
        // Snapshot the ids so the callback may mutate the store.
        let ids: Vec<BlockId> = self.blocks.lock().keys().copied().collect();
        for id in &ids {
            callback(id)?;
        }
        Ok(())
    }
}
