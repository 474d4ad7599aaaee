// SPDX-License-Identifier: MPL-2.0

use super::Cipher;
use crate::layers::bio::{BlockId, BlockStore};
use crate::prelude::*;

/// A block store decorator that encrypts and authenticates every block.
///
/// Pure pass-through otherwise: ids, counts, and iteration come from the
/// base store. The usable block size shrinks by the cipher's fixed
/// overhead.
#[derive(Debug)]
pub struct EncryptedBlockStore<C, B> {
    cipher: C,
    base: B,
}

impl<C: Cipher, B: BlockStore> EncryptedBlockStore<C, B> {
    pub fn new(cipher: C, base: B) -> Self {
        Self { cipher, base }
    }
}

impl<C: Cipher, B: BlockStore> BlockStore for EncryptedBlockStore<C, B> {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        let ciphertext = self.cipher.encrypt(data)?;
        self.base.try_create(id, &ciphertext)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match self.base.load(id)? {
            Some(ciphertext) => Ok(Some(self.cipher.decrypt(&ciphertext)?)),
            None => Ok(None),
        }
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        let ciphertext = self.cipher.encrypt(data)?;
        self.base.store(id, &ciphertext)
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        self.base.remove(id)
    }

    fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.base.estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, physical_block_size: u64) -> Result<u64> {
        let base_size = self.base.block_size_from_physical_block_size(physical_block_size)?;
        Ok(base_size.saturating_sub(C::CIPHERTEXT_OVERHEAD as u64))
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId) -> Result<()>) -> Result<()> {
        self.base.for_each_block(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::InMemoryBlockStore;
    use crate::layers::crypto::{Aes256Gcm, EncryptionKey};

    fn store() -> EncryptedBlockStore<Aes256Gcm, InMemoryBlockStore> {
        let cipher = Aes256Gcm::with_key(EncryptionKey::new_random(32)).unwrap();
        EncryptedBlockStore::new(cipher, InMemoryBlockStore::new())
    }

    #[test]
    fn load_after_store_roundtrips() {
        let store = store();
        let id = BlockId::random();
        store.store(&id, b"secret payload").unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap(), b"secret payload");
    }

    #[test]
    fn stored_bytes_are_not_plaintext() {
        let cipher = Aes256Gcm::with_key(EncryptionKey::new_random(32)).unwrap();
        let base = std::sync::Arc::new(InMemoryBlockStore::new());
        let store = EncryptedBlockStore::new(cipher, base.clone());
        let id = BlockId::random();
        store.store(&id, b"secret payload").unwrap();

        let raw = base.load(&id).unwrap().unwrap();
        assert_eq!(raw.len(), b"secret payload".len() + Aes256Gcm::CIPHERTEXT_OVERHEAD);
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn tampered_block_fails_load() {
        let cipher = Aes256Gcm::with_key(EncryptionKey::new_random(32)).unwrap();
        let base = std::sync::Arc::new(InMemoryBlockStore::new());
        let store = EncryptedBlockStore::new(cipher, base.clone());
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();

        let mut raw = base.load(&id).unwrap().unwrap();
        raw[20] ^= 0xFF;
        base.store(&id, &raw).unwrap();

        assert_eq!(store.load(&id).unwrap_err().errno(), IntegrityViolation);
    }

    #[test]
    fn missing_block_is_none() {
        let store = store();
        assert!(store.load(&BlockId::random()).unwrap().is_none());
    }

    #[test]
    fn block_size_subtracts_overhead() {
        let store = store();
        assert_eq!(
            store.block_size_from_physical_block_size(1024).unwrap(),
            1024 - Aes256Gcm::CIPHERTEXT_OVERHEAD as u64
        );
        assert_eq!(store.block_size_from_physical_block_size(10).unwrap(), 0);
    }
}
