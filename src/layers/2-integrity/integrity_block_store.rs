// SPDX-License-Identifier: MPL-2.0

use std::sync::atomic::{AtomicBool, Ordering};

use super::KnownBlockVersions;
use crate::layers::bio::{BlockId, BlockStore};
use crate::prelude::*;
use crate::util::{ByteReader, ByteWriter};

/// Configuration switches for [`IntegrityBlockStore`].
#[derive(Clone, Copy, Debug)]
pub struct IntegrityConfig {
    /// Downgrades every integrity violation to a warning and disables
    /// the sticky failure latch. For recovering a filesystem whose
    /// integrity state was lost or intentionally reset.
    pub allow_integrity_violations: bool,
    /// Treats a missing block that should exist as an integrity
    /// violation. Only sound for single-client use; a peer legitimately
    /// deleting blocks looks exactly like an attacker deleting them.
    pub missing_block_is_integrity_violation: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            allow_integrity_violations: false,
            missing_block_is_integrity_violation: true,
        }
    }
}

/// A block store decorator that tags every block with a writer id and a
/// monotonic version, and verifies both on load.
///
/// # Block layout
///
/// The header is prepended to the payload handed to the base store; the
/// encryption layer below covers the whole thing, so nothing here is
/// attacker-readable or malleable without breaking the AEAD tag first.
///
/// ```text
/// ┌──────────┬───────────┬────────────┬──────────┬─────────────┐
/// │ u16 tag  │ 16B block │ u32 client │ u64      │   payload   │
/// │ (format) │    id     │ (writer)   │ version  │             │
/// └──────────┴───────────┴────────────┴──────────┴─────────────┘
/// ```
///
/// The redundant block id catches an attacker moving ciphertexts between
/// ids; the version check against [`KnownBlockVersions`] catches
/// rollbacks and re-introductions; the (optional) missing-block check
/// catches deletions.
///
/// # Sticky failure
///
/// The first violation latches the store: every subsequent operation
/// fails until the operator deletes the integrity state file out of
/// band and re-opens the filesystem. The latch can be disabled with
/// [`IntegrityConfig::allow_integrity_violations`].
#[derive(Debug)]
pub struct IntegrityBlockStore<B> {
    base: B,
    known_versions: KnownBlockVersions,
    config: IntegrityConfig,
    violation_detected: AtomicBool,
}

const FORMAT_VERSION_HEADER: u16 = 1;
#[cfg(feature = "legacy-blocks")]
const FORMAT_VERSION_HEADER_OLD: u16 = 0;

const ID_HEADER_OFFSET: usize = 2;
const CLIENTID_HEADER_OFFSET: usize = ID_HEADER_OFFSET + BlockId::BINARY_LEN;
const VERSION_HEADER_OFFSET: usize = CLIENTID_HEADER_OFFSET + 4;
const HEADER_LENGTH: usize = VERSION_HEADER_OFFSET + 8;

impl<B: BlockStore> IntegrityBlockStore<B> {
    pub fn new(base: B, known_versions: KnownBlockVersions, config: IntegrityConfig) -> Self {
        Self {
            base,
            known_versions,
            config,
            violation_detected: AtomicBool::new(false),
        }
    }

    pub fn my_client_id(&self) -> u32 {
        self.known_versions.my_client_id()
    }

    /// Reports an integrity violation.
    ///
    /// Returns `Ok(())` if violations are allowed by configuration (the
    /// caller continues as if nothing happened); otherwise latches the
    /// store and returns the error.
    fn integrity_violation_detected(&self, reason: &'static str) -> Result<()> {
        if self.config.allow_integrity_violations {
            warn!("Integrity violation (but integrity checks are disabled): {reason}");
            return Ok(());
        }
        self.violation_detected.store(true, Ordering::Release);
        Err(Error::with_msg(IntegrityViolation, reason))
    }

    fn check_no_past_integrity_violations(&self) -> Result<()> {
        if self.violation_detected.load(Ordering::Acquire) {
            return_errno_with_msg!(
                IntegrityViolation,
                "an integrity violation was detected before; refusing any further access. \
                 To reset the integrity data (i.e. to accept changes made by a potential \
                 attacker), delete the integrity state file and re-open the filesystem"
            );
        }
        Ok(())
    }

    fn prepend_header(&self, id: &BlockId, version: u64, data: &[u8]) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(HEADER_LENGTH + data.len());
        writer.write_u16(FORMAT_VERSION_HEADER);
        writer.write_bytes(id.as_bytes());
        writer.write_u32(self.known_versions.my_client_id());
        writer.write_u64(version);
        writer.write_bytes(data);
        writer.into_vec()
    }

    /// Verifies the header of a loaded block: format tag, stored block
    /// id, and version freshness.
    fn check_header(&self, expected_id: &BlockId, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        let format = reader.read_u16()?;
        if format != FORMAT_VERSION_HEADER {
            return_errno_with_msg!(
                CorruptedStorage,
                "block has an unknown format version. Was it created with a newer version?"
            );
        }
        let stored_id = BlockId::from_bytes(reader.read_array()?);
        if stored_id != *expected_id {
            self.integrity_violation_detected(
                "the block id does not match the id it is stored under. \
                 Did an attacker try to rename some blocks?",
            )?;
        }
        let client_id = reader.read_u32()?;
        let version = reader.read_u64()?;
        if !self
            .known_versions
            .check_and_update_version(client_id, expected_id, version)?
        {
            self.integrity_violation_detected(
                "the block version number is too low. Did an attacker try to roll back the \
                 block or to re-introduce a deleted block?",
            )?;
        }
        Ok(())
    }

    #[cfg(feature = "legacy-blocks")]
    fn migrate_legacy_block(&self, id: &BlockId, data: &[u8]) -> Result<Vec<u8>> {
        // The legacy header lacked the block id between the format tag
        // and the client id; re-insert it and tag the new format.
        let mut reader = ByteReader::new(data);
        let _old_format = reader.read_u16()?;
        let client_id = reader.read_u32()?;
        let version = reader.read_u64()?;
        let payload = reader.read_bytes(reader.remaining())?;

        let mut writer = ByteWriter::with_capacity(HEADER_LENGTH + payload.len());
        writer.write_u16(FORMAT_VERSION_HEADER);
        writer.write_bytes(id.as_bytes());
        writer.write_u32(client_id);
        writer.write_u64(version);
        writer.write_bytes(payload);
        Ok(writer.into_vec())
    }
}

impl<B: BlockStore> BlockStore for IntegrityBlockStore<B> {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        self.check_no_past_integrity_violations()?;
        let version = self.known_versions.increment_version(id)?;
        let data_with_header = self.prepend_header(id, version, data);
        self.base.try_create(id, &data_with_header)
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        self.check_no_past_integrity_violations()?;
        let Some(loaded) = self.base.load(id)? else {
            if self.config.missing_block_is_integrity_violation
                && self.known_versions.block_should_exist(id)
            {
                self.integrity_violation_detected(
                    "a block that should exist was not found. Did an attacker delete it?",
                )?;
            }
            return Ok(None);
        };

        #[cfg(feature = "legacy-blocks")]
        if loaded.len() >= 2
            && u16::from_le_bytes([loaded[0], loaded[1]]) == FORMAT_VERSION_HEADER_OLD
        {
            let migrated = self.migrate_legacy_block(id, &loaded)?;
            self.check_header(id, &migrated)?;
            let content = migrated[HEADER_LENGTH..].to_vec();
            // Store back in the current layout. Not transactional: a
            // crash here leaves the block in the old format and the next
            // load migrates it again.
            self.store(id, &content)?;
            return Ok(Some(content));
        }

        self.check_header(id, &loaded)?;
        Ok(Some(loaded[HEADER_LENGTH..].to_vec()))
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        self.check_no_past_integrity_violations()?;
        let version = self.known_versions.increment_version(id)?;
        let data_with_header = self.prepend_header(id, version, data);
        self.base.store(id, &data_with_header)
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        self.check_no_past_integrity_violations()?;
        self.known_versions.mark_block_as_deleted(id)?;
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
        Ok(base_size.saturating_sub(HEADER_LENGTH as u64))
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId) -> Result<()>) -> Result<()> {
        self.check_no_past_integrity_violations()?;
        if !self.config.missing_block_is_integrity_violation {
            return self.base.for_each_block(callback);
        }

        let mut expected = self.known_versions.existing_blocks();
        self.base.for_each_block(&mut |id| {
            expected.remove(id);
            callback(id)
        })?;
        if !expected.is_empty() {
            self.integrity_violation_detected(
                "a block that should exist was not found. Did an attacker delete it?",
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::InMemoryBlockStore;

    const MY_CLIENT_ID: u32 = 0x1001;

    fn new_store(
        dir: &tempfile::TempDir,
        base: Arc<InMemoryBlockStore>,
        config: IntegrityConfig,
    ) -> IntegrityBlockStore<Arc<InMemoryBlockStore>> {
        let known_versions =
            KnownBlockVersions::new(dir.path().join("integrity.state"), MY_CLIENT_ID).unwrap();
        IntegrityBlockStore::new(base, known_versions, config)
    }

    fn default_store(
        dir: &tempfile::TempDir,
        base: Arc<InMemoryBlockStore>,
    ) -> IntegrityBlockStore<Arc<InMemoryBlockStore>> {
        new_store(dir, base, IntegrityConfig::default())
    }

    #[test]
    fn load_after_store_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = default_store(&dir, Arc::new(InMemoryBlockStore::new()));
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap(), b"payload");
        // Loading twice is fine.
        assert_eq!(store.load(&id).unwrap().unwrap(), b"payload");
    }

    #[test]
    fn header_layout_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = default_store(&dir, base.clone());
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();

        let raw = base.load(&id).unwrap().unwrap();
        assert_eq!(raw.len(), HEADER_LENGTH + b"payload".len());
        assert_eq!(u16::from_le_bytes([raw[0], raw[1]]), FORMAT_VERSION_HEADER);
        assert_eq!(&raw[ID_HEADER_OFFSET..CLIENTID_HEADER_OFFSET], id.as_bytes());
        let client = u32::from_le_bytes(raw[CLIENTID_HEADER_OFFSET..VERSION_HEADER_OFFSET].try_into().unwrap());
        assert_eq!(client, MY_CLIENT_ID);
        let version = u64::from_le_bytes(raw[VERSION_HEADER_OFFSET..HEADER_LENGTH].try_into().unwrap());
        assert_eq!(version, 1);
        assert_eq!(&raw[HEADER_LENGTH..], b"payload");
    }

    #[test]
    fn rollback_attack_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = default_store(&dir, base.clone());
        let id = BlockId::random();

        store.store(&id, b"version 1").unwrap();
        let old_raw = base.load(&id).unwrap().unwrap();
        store.store(&id, b"version 2").unwrap();

        // Attacker restores the old bytes.
        base.store(&id, &old_raw).unwrap();

        let err = store.load(&id).unwrap_err();
        assert_eq!(err.errno(), IntegrityViolation);
    }

    #[test]
    fn reintroduction_attack_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = default_store(&dir, base.clone());
        let id = BlockId::random();

        store.store(&id, b"payload").unwrap();
        let old_raw = base.load(&id).unwrap().unwrap();
        store.remove(&id).unwrap();

        // Attacker re-writes the deleted ciphertext.
        base.store(&id, &old_raw).unwrap();

        let err = store.load(&id).unwrap_err();
        assert_eq!(err.errno(), IntegrityViolation);
    }

    #[test]
    fn swapped_blocks_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = default_store(&dir, base.clone());
        let id1 = BlockId::random();
        let id2 = BlockId::random();
        store.store(&id1, b"block one").unwrap();
        store.store(&id2, b"block two").unwrap();

        // Attacker swaps the two blocks' contents.
        let raw1 = base.load(&id1).unwrap().unwrap();
        let raw2 = base.load(&id2).unwrap().unwrap();
        base.store(&id1, &raw2).unwrap();
        base.store(&id2, &raw1).unwrap();

        assert_eq!(store.load(&id1).unwrap_err().errno(), IntegrityViolation);
    }

    #[test]
    fn missing_block_is_detected_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = default_store(&dir, base.clone());
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();

        // Attacker deletes the block behind our back.
        base.remove(&id).unwrap();

        let err = store.load(&id).unwrap_err();
        assert_eq!(err.errno(), IntegrityViolation);
    }

    #[test]
    fn missing_block_is_ok_when_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = new_store(
            &dir,
            base.clone(),
            IntegrityConfig {
                allow_integrity_violations: false,
                missing_block_is_integrity_violation: false,
            },
        );
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();
        base.remove(&id).unwrap();
        assert_eq!(store.load(&id).unwrap(), None);
    }

    #[test]
    fn removed_block_loads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = default_store(&dir, Arc::new(InMemoryBlockStore::new()));
        let id = BlockId::random();
        store.store(&id, b"payload").unwrap();
        assert!(store.remove(&id).unwrap());
        assert_eq!(store.load(&id).unwrap(), None);
    }

    #[test]
    fn violations_are_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = default_store(&dir, base.clone());
        let id = BlockId::random();
        store.store(&id, b"v1").unwrap();
        let old_raw = base.load(&id).unwrap().unwrap();
        store.store(&id, b"v2").unwrap();
        base.store(&id, &old_raw).unwrap();
        assert!(store.load(&id).is_err());

        // Every operation refuses now, even on other blocks.
        let other = BlockId::random();
        assert_eq!(store.store(&other, b"x").unwrap_err().errno(), IntegrityViolation);
        assert_eq!(store.load(&other).unwrap_err().errno(), IntegrityViolation);
        assert_eq!(store.remove(&other).unwrap_err().errno(), IntegrityViolation);
    }

    #[test]
    fn allowed_violations_degrade_to_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = new_store(
            &dir,
            base.clone(),
            IntegrityConfig {
                allow_integrity_violations: true,
                missing_block_is_integrity_violation: true,
            },
        );
        let id = BlockId::random();
        store.store(&id, b"v1").unwrap();
        let old_raw = base.load(&id).unwrap().unwrap();
        store.store(&id, b"v2").unwrap();
        base.store(&id, &old_raw).unwrap();

        // Rolled-back content is surfaced, and nothing is latched.
        assert_eq!(store.load(&id).unwrap().unwrap(), b"v1");
        store.store(&id, b"v3").unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap(), b"v3");
    }

    #[test]
    fn multi_client_versions_coexist() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let client_a = IntegrityBlockStore::new(
            base.clone(),
            KnownBlockVersions::new(dir1.path().join("s"), 10).unwrap(),
            IntegrityConfig {
                allow_integrity_violations: false,
                missing_block_is_integrity_violation: false,
            },
        );
        let client_b = IntegrityBlockStore::new(
            base.clone(),
            KnownBlockVersions::new(dir2.path().join("s"), 20).unwrap(),
            IntegrityConfig {
                allow_integrity_violations: false,
                missing_block_is_integrity_violation: false,
            },
        );
        let id = BlockId::random();

        client_a.store(&id, b"from a").unwrap();
        client_b.load(&id).unwrap().unwrap();
        client_b.store(&id, b"from b").unwrap();

        // A sees B's newer write, then overwrites with a version greater
        // than anything either client observed.
        assert_eq!(client_a.load(&id).unwrap().unwrap(), b"from b");
        client_a.store(&id, b"from a again").unwrap();
        assert_eq!(client_b.load(&id).unwrap().unwrap(), b"from a again");
    }

    #[test]
    fn for_each_block_detects_missing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = default_store(&dir, base.clone());
        let id1 = BlockId::random();
        let id2 = BlockId::random();
        store.store(&id1, b"one").unwrap();
        store.store(&id2, b"two").unwrap();

        base.remove(&id2).unwrap();

        let err = store.for_each_block(&mut |_| Ok(())).unwrap_err();
        assert_eq!(err.errno(), IntegrityViolation);
    }

    #[test]
    fn block_size_subtracts_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = default_store(&dir, Arc::new(InMemoryBlockStore::new()));
        assert_eq!(
            store.block_size_from_physical_block_size(1024).unwrap(),
            1024 - HEADER_LENGTH as u64
        );
    }

    #[cfg(feature = "legacy-blocks")]
    #[test]
    fn legacy_block_is_migrated_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let base = Arc::new(InMemoryBlockStore::new());
        let store = default_store(&dir, base.clone());
        let id = BlockId::random();

        // Hand-craft a block in the old layout (no id field).
        let mut writer = ByteWriter::new();
        writer.write_u16(FORMAT_VERSION_HEADER_OLD);
        writer.write_u32(MY_CLIENT_ID);
        writer.write_u64(1);
        writer.write_bytes(b"legacy payload");
        base.store(&id, &writer.into_vec()).unwrap();

        assert_eq!(store.load(&id).unwrap().unwrap(), b"legacy payload");
        // The stored block is now in the current layout.
        let raw = base.load(&id).unwrap().unwrap();
        assert_eq!(u16::from_le_bytes([raw[0], raw[1]]), FORMAT_VERSION_HEADER);
        assert_eq!(&raw[ID_HEADER_OFFSET..CLIENTID_HEADER_OFFSET], id.as_bytes());
        assert_eq!(store.load(&id).unwrap().unwrap(), b"legacy payload");
    }
}
