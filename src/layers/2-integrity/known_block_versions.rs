// SPDX-License-Identifier: MPL-2.0

use std::fs;
use std::path::{Path, PathBuf};

use crate::layers::bio::BlockId;
use crate::os::{HashMap, HashSet, Mutex};
use crate::prelude::*;
use crate::util::{ByteReader, ByteWriter};

/// The persistent table of block versions this client has seen.
///
/// For every `(client id, block id)` pair the table remembers the
/// highest version observed, plus a tombstone set of deleted blocks and,
/// per block, which client wrote the version that was accepted last.
/// Together these let the integrity layer reject rollbacks (version not
/// higher than what we saw), re-introductions (tombstoned block
/// reappearing without a strictly newer version from its writer), and
/// deletions (a known live block missing from the backend).
///
/// # On-disk format
///
/// ```text
/// ┌──────┬──────────┬─────┬──────────────────────────┬─────┬────────┬─────┬──────────────┐
/// │ u16  │   u32    │ u64 │ (u32 client, 16B block,  │ u64 │ 16B    │ u64 │ (16B block,  │
/// │ tag  │ clientId │  n  │  u64 version) × n        │  m  │ id × m │  k  │  u32) × k    │
/// └──────┴──────────┴─────┴──────────────────────────┴─────┴────────┴─────┴──────────────┘
///            mine          highest seen versions       tombstones       last writers
/// ```
///
/// All integers little-endian. Writes go to a sibling temp file which is
/// synced and then atomically renamed over the table, so a crash leaves
/// either the old or the new table, never a torn one.
///
/// # Thread safety
///
/// One process owns one table file. Every operation takes the single
/// internal lock; mutations are persisted before they return.
#[derive(Debug)]
pub struct KnownBlockVersions {
    path: PathBuf,
    my_client_id: u32,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    /// block id → (client id → highest version seen).
    versions: HashMap<BlockId, HashMap<u32, u64>>,
    /// Blocks this client deleted or observed as deleted.
    deleted_blocks: HashSet<BlockId>,
    /// block id → client whose version was accepted last. Absent for
    /// tombstoned blocks, so an exact replay of the deleted version is
    /// rejected even when it comes from the original writer.
    last_writer: HashMap<BlockId, u32>,
}

const FORMAT_VERSION: u16 = 1;

impl KnownBlockVersions {
    /// Opens the table at `path`, creating an empty one if the file does
    /// not exist yet.
    ///
    /// `my_client_id` is this process's writer id from the local state;
    /// an existing table recorded for a different client is rejected.
    pub fn new(path: PathBuf, my_client_id: u32) -> Result<Self> {
        let state = match fs::read(&path) {
            Ok(bytes) => Self::deserialize(&bytes, my_client_id)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => State {
                versions: HashMap::new(),
                deleted_blocks: HashSet::new(),
                last_writer: HashMap::new(),
            },
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            my_client_id,
            state: Mutex::new(state),
        })
    }

    pub fn my_client_id(&self) -> u32 {
        self.my_client_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a version strictly greater than any version ever observed
    /// for `id`, from any client, and records it as our own.
    ///
    /// Writing under the returned version makes the block the newest one
    /// from every client's point of view, so an attacker cannot replay an
    /// older peer's block under this id.
    pub fn increment_version(&self, id: &BlockId) -> Result<u64> {
        let mut state = self.state.lock();
        let per_client = state.versions.entry(*id).or_default();
        let max_seen = per_client.values().copied().max().unwrap_or(0);
        if max_seen == u64::MAX {
            return_errno_with_msg!(UsageError, "block version counter overflow");
        }
        let version = max_seen + 1;
        per_client.insert(self.my_client_id, version);
        state.last_writer.insert(*id, self.my_client_id);
        // Writing the block ourselves legitimately resurrects it.
        state.deleted_blocks.remove(id);
        self.save(&state)?;
        Ok(version)
    }

    /// Checks whether `(client_id, id, version)` read from storage is
    /// acceptable, and records it if so.
    ///
    /// Accepted iff the version is strictly greater than the last one
    /// seen from this client, or equal to it while this client is also
    /// the block's last writer (re-loading a block nobody touched).
    /// Tombstoned blocks have no last writer, so they only come back
    /// with a strictly greater version, which also clears the tombstone.
    pub fn check_and_update_version(
        &self,
        client_id: u32,
        id: &BlockId,
        version: u64,
    ) -> Result<bool> {
        if version == 0 {
            // Versions start at 1; a zero header is forged or corrupt.
            return Ok(false);
        }
        let mut state = self.state.lock();
        let last_seen = state
            .versions
            .get(id)
            .and_then(|per_client| per_client.get(&client_id))
            .copied()
            .unwrap_or(0);
        if version < last_seen {
            return Ok(false);
        }
        if version == last_seen && state.last_writer.get(id) != Some(&client_id) {
            return Ok(false);
        }
        state.versions.entry(*id).or_default().insert(client_id, version);
        state.last_writer.insert(*id, client_id);
        state.deleted_blocks.remove(id);
        self.save(&state)?;
        Ok(true)
    }

    /// Records that this client deleted `id` (or observed its deletion).
    pub fn mark_block_as_deleted(&self, id: &BlockId) -> Result<()> {
        let mut state = self.state.lock();
        state.deleted_blocks.insert(*id);
        state.last_writer.remove(id);
        self.save(&state)?;
        Ok(())
    }

    /// Whether `id` is a block we know of that has not been deleted.
    pub fn block_should_exist(&self, id: &BlockId) -> bool {
        let state = self.state.lock();
        state.versions.contains_key(id) && !state.deleted_blocks.contains(id)
    }

    /// All ids we know of that have not been deleted.
    pub fn existing_blocks(&self) -> HashSet<BlockId> {
        let state = self.state.lock();
        state
            .versions
            .keys()
            .filter(|id| !state.deleted_blocks.contains(*id))
            .copied()
            .collect()
    }

    fn save(&self, state: &State) -> Result<()> {
        let mut writer = ByteWriter::new();
        writer.write_u16(FORMAT_VERSION);
        writer.write_u32(self.my_client_id);

        let mut version_entries: Vec<(u32, BlockId, u64)> = state
            .versions
            .iter()
            .flat_map(|(id, per_client)| {
                per_client
                    .iter()
                    .map(move |(client, version)| (*client, *id, *version))
            })
            .collect();
        version_entries.sort();
        writer.write_u64(version_entries.len() as u64);
        for (client, id, version) in version_entries {
            writer.write_u32(client);
            writer.write_bytes(id.as_bytes());
            writer.write_u64(version);
        }

        let mut tombstones: Vec<BlockId> = state.deleted_blocks.iter().copied().collect();
        tombstones.sort();
        writer.write_u64(tombstones.len() as u64);
        for id in tombstones {
            writer.write_bytes(id.as_bytes());
        }

        let mut last_writers: Vec<(BlockId, u32)> = state
            .last_writer
            .iter()
            .map(|(id, client)| (*id, *client))
            .collect();
        last_writers.sort();
        writer.write_u64(last_writers.len() as u64);
        for (id, client) in last_writers {
            writer.write_bytes(id.as_bytes());
            writer.write_u32(client);
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&writer.into_vec())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn deserialize(bytes: &[u8], expected_client_id: u32) -> Result<State> {
        let mut reader = ByteReader::new(bytes);
        if reader.read_u16()? != FORMAT_VERSION {
            return_errno_with_msg!(
                BadConfig,
                "integrity state file has an unknown format version"
            );
        }
        let stored_client_id = reader.read_u32()?;
        if stored_client_id != expected_client_id {
            return_errno_with_msg!(BadConfig, "integrity state file belongs to another client");
        }

        let mut versions: HashMap<BlockId, HashMap<u32, u64>> = HashMap::new();
        let num_versions = reader.read_u64()?;
        for _ in 0..num_versions {
            let client = reader.read_u32()?;
            let id = BlockId::from_bytes(reader.read_array()?);
            let version = reader.read_u64()?;
            versions.entry(id).or_default().insert(client, version);
        }

        let mut deleted_blocks = HashSet::new();
        let num_tombstones = reader.read_u64()?;
        for _ in 0..num_tombstones {
            deleted_blocks.insert(BlockId::from_bytes(reader.read_array()?));
        }

        let mut last_writer = HashMap::new();
        let num_last_writers = reader.read_u64()?;
        for _ in 0..num_last_writers {
            let id = BlockId::from_bytes(reader.read_array()?);
            let client = reader.read_u32()?;
            last_writer.insert(id, client);
        }

        if !reader.is_empty() {
            return_errno_with_msg!(BadConfig, "trailing data in integrity state file");
        }
        Ok(State {
            versions,
            deleted_blocks,
            last_writer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MY_CLIENT_ID: u32 = 0x1234;
    const OTHER_CLIENT_ID: u32 = 0x4321;

    fn table(dir: &tempfile::TempDir) -> KnownBlockVersions {
        KnownBlockVersions::new(dir.path().join("integrity.state"), MY_CLIENT_ID).unwrap()
    }

    #[test]
    fn increment_version_starts_at_one_and_counts_up() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id = BlockId::random();
        assert_eq!(table.increment_version(&id).unwrap(), 1);
        assert_eq!(table.increment_version(&id).unwrap(), 2);
        assert_eq!(table.increment_version(&id).unwrap(), 3);
    }

    #[test]
    fn increment_version_is_greater_than_other_clients() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id = BlockId::random();
        assert!(table.check_and_update_version(OTHER_CLIENT_ID, &id, 7).unwrap());
        assert_eq!(table.increment_version(&id).unwrap(), 8);
    }

    #[test]
    fn check_accepts_increasing_rejects_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id = BlockId::random();
        assert!(table.check_and_update_version(OTHER_CLIENT_ID, &id, 5).unwrap());
        assert!(table.check_and_update_version(OTHER_CLIENT_ID, &id, 6).unwrap());
        assert!(!table.check_and_update_version(OTHER_CLIENT_ID, &id, 5).unwrap());
        assert!(!table.check_and_update_version(OTHER_CLIENT_ID, &id, 1).unwrap());
    }

    #[test]
    fn check_accepts_equal_version_only_from_last_writer() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id = BlockId::random();
        assert!(table.check_and_update_version(OTHER_CLIENT_ID, &id, 5).unwrap());
        // Re-loading the same block is fine.
        assert!(table.check_and_update_version(OTHER_CLIENT_ID, &id, 5).unwrap());
        // After someone else wrote, the old (client, version) pair is stale.
        assert!(table.check_and_update_version(MY_CLIENT_ID, &id, 6).unwrap());
        assert!(!table.check_and_update_version(OTHER_CLIENT_ID, &id, 5).unwrap());
    }

    #[test]
    fn loading_own_block_after_store_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id = BlockId::random();
        let version = table.increment_version(&id).unwrap();
        assert!(table.check_and_update_version(MY_CLIENT_ID, &id, version).unwrap());
    }

    #[test]
    fn zero_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id = BlockId::random();
        assert!(!table.check_and_update_version(OTHER_CLIENT_ID, &id, 0).unwrap());
    }

    #[test]
    fn tombstoned_block_does_not_come_back_with_old_version() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id = BlockId::random();
        assert!(table.check_and_update_version(OTHER_CLIENT_ID, &id, 5).unwrap());
        table.mark_block_as_deleted(&id).unwrap();
        assert!(!table.block_should_exist(&id));
        // Exact replay of the deleted version: rejected.
        assert!(!table.check_and_update_version(OTHER_CLIENT_ID, &id, 5).unwrap());
        // A strictly newer version from the writer resurrects the block.
        assert!(table.check_and_update_version(OTHER_CLIENT_ID, &id, 6).unwrap());
        assert!(table.block_should_exist(&id));
    }

    #[test]
    fn own_write_resurrects_tombstoned_block() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id = BlockId::random();
        table.increment_version(&id).unwrap();
        table.mark_block_as_deleted(&id).unwrap();
        let version = table.increment_version(&id).unwrap();
        assert_eq!(version, 2);
        assert!(table.block_should_exist(&id));
    }

    #[test]
    fn existing_blocks_excludes_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let id1 = BlockId::random();
        let id2 = BlockId::random();
        table.increment_version(&id1).unwrap();
        table.increment_version(&id2).unwrap();
        table.mark_block_as_deleted(&id2).unwrap();
        let existing = table.existing_blocks();
        assert!(existing.contains(&id1));
        assert!(!existing.contains(&id2));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = BlockId::random();
        let tombstoned = BlockId::random();
        {
            let table = table(&dir);
            table.increment_version(&id).unwrap();
            table.increment_version(&id).unwrap();
            table.increment_version(&tombstoned).unwrap();
            table.mark_block_as_deleted(&tombstoned).unwrap();
        }
        let table = table(&dir);
        // Version continuity: next version is 3, and re-loading our own
        // version-2 block still works.
        assert!(table.check_and_update_version(MY_CLIENT_ID, &id, 2).unwrap());
        assert_eq!(table.increment_version(&id).unwrap(), 3);
        assert!(!table.block_should_exist(&tombstoned));
    }

    #[test]
    fn rejects_table_of_other_client() {
        let dir = tempfile::tempdir().unwrap();
        {
            let table = table(&dir);
            table.increment_version(&BlockId::random()).unwrap();
        }
        let err =
            KnownBlockVersions::new(dir.path().join("integrity.state"), OTHER_CLIENT_ID)
                .unwrap_err();
        assert_eq!(err.errno(), BadConfig);
    }
}
