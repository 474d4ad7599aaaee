// SPDX-License-Identifier: MPL-2.0

use std::time::{SystemTime, UNIX_EPOCH};

use crate::layers::bio::BlockId;
use crate::prelude::*;
use crate::util::{ByteReader, ByteWriter};

/// What a directory entry points at. The values double as the blob type
/// magics.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum EntryType {
    Dir = super::MAGIC_DIR,
    File = super::MAGIC_FILE,
    Symlink = super::MAGIC_SYMLINK,
}

impl EntryType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            super::MAGIC_DIR => Ok(Self::Dir),
            super::MAGIC_FILE => Ok(Self::File),
            super::MAGIC_SYMLINK => Ok(Self::Symlink),
            _ => return_errno_with_msg!(CorruptedStorage, "unknown directory entry type"),
        }
    }
}

/// A point in time as seconds and nanoseconds since the epoch.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Timespec {
    pub secs: i64,
    pub nanos: i64,
}

impl Timespec {
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since_epoch) => Self {
                secs: since_epoch.as_secs() as i64,
                nanos: since_epoch.subsec_nanos() as i64,
            },
            Err(before_epoch) => Self {
                secs: -(before_epoch.duration().as_secs() as i64),
                nanos: before_epoch.duration().subsec_nanos() as i64,
            },
        }
    }
}

/// One entry of a directory blob.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DirEntry {
    pub entry_type: EntryType,
    /// Unique within the parent directory.
    pub name: String,
    pub blob_id: BlockId,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub last_access_time: Timespec,
    pub last_modification_time: Timespec,
    pub last_metadata_change_time: Timespec,
}

impl DirEntry {
    fn serialize(&self, writer: &mut ByteWriter) {
        writer.write_u8(self.entry_type as u8);
        debug_assert!(self.name.len() <= u16::MAX as usize);
        writer.write_u16(self.name.len() as u16);
        writer.write_bytes(self.name.as_bytes());
        writer.write_bytes(self.blob_id.as_bytes());
        writer.write_u32(self.mode);
        writer.write_u32(self.uid);
        writer.write_u32(self.gid);
        for time in [
            &self.last_access_time,
            &self.last_modification_time,
            &self.last_metadata_change_time,
        ] {
            writer.write_i64(time.secs);
            writer.write_i64(time.nanos);
        }
    }

    fn deserialize(reader: &mut ByteReader<'_>) -> Result<Self> {
        let entry_type = EntryType::from_u8(reader.read_u8()?)?;
        let name_len = reader.read_u16()? as usize;
        let name = std::str::from_utf8(reader.read_bytes(name_len)?)
            .map_err(|_| Error::with_msg(CorruptedStorage, "entry name is not valid UTF-8"))?
            .to_string();
        let blob_id = BlockId::from_bytes(reader.read_array()?);
        let mode = reader.read_u32()?;
        let uid = reader.read_u32()?;
        let gid = reader.read_u32()?;
        let mut times = [Timespec::default(); 3];
        for time in &mut times {
            time.secs = reader.read_i64()?;
            time.nanos = reader.read_i64()?;
        }
        Ok(Self {
            entry_type,
            name,
            blob_id,
            mode,
            uid,
            gid,
            last_access_time: times[0],
            last_modification_time: times[1],
            last_metadata_change_time: times[2],
        })
    }
}

/// The in-memory entry table of a directory blob, kept sorted by name
/// so serialization is deterministic and lookups are binary searches.
#[derive(Debug)]
pub(super) struct DirEntryList {
    entries: Vec<DirEntry>,
}

impl DirEntryList {
    pub fn new_empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        for entry in &self.entries {
            entry.serialize(&mut writer);
        }
        writer.into_vec()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let mut entries = Vec::new();
        while !reader.is_empty() {
            let entry = DirEntry::deserialize(&mut reader)?;
            if let Some(previous) = entries.last() {
                let previous: &DirEntry = previous;
                if previous.name >= entry.name {
                    return_errno_with_msg!(
                        CorruptedStorage,
                        "directory entries are not sorted by name"
                    );
                }
            }
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn add(&mut self, entry: DirEntry) -> Result<()> {
        match self.entries.binary_search_by(|e| e.name.as_str().cmp(&entry.name)) {
            Ok(_) => {
                return_errno_with_msg!(AlreadyExists, "an entry with this name already exists")
            }
            Err(insert_at) => {
                self.entries.insert(insert_at, entry);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn get_by_id(&self, blob_id: &BlockId) -> Option<&DirEntry> {
        self.entries.iter().find(|e| &e.blob_id == blob_id)
    }

    pub fn remove_by_name(&mut self, name: &str) -> Result<DirEntry> {
        match self.entries.binary_search_by(|e| e.name.as_str().cmp(name)) {
            Ok(i) => Ok(self.entries.remove(i)),
            Err(_) => return_errno_with_msg!(NotFound, "no entry with this name"),
        }
    }

    pub fn remove_by_id(&mut self, blob_id: &BlockId) -> Result<DirEntry> {
        match self.entries.iter().position(|e| &e.blob_id == blob_id) {
            Some(i) => Ok(self.entries.remove(i)),
            None => return_errno_with_msg!(NotFound, "no entry with this blob id"),
        }
    }

    pub fn set_mode(&mut self, blob_id: &BlockId, mode: u32) -> Result<()> {
        let entry = self.get_mut_by_id(blob_id)?;
        entry.mode = mode;
        entry.last_metadata_change_time = Timespec::now();
        Ok(())
    }

    /// Returns whether anything changed.
    pub fn set_uid_gid(
        &mut self,
        blob_id: &BlockId,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<bool> {
        let entry = self.get_mut_by_id(blob_id)?;
        let mut changed = false;
        if let Some(uid) = uid {
            if entry.uid != uid {
                entry.uid = uid;
                changed = true;
            }
        }
        if let Some(gid) = gid {
            if entry.gid != gid {
                entry.gid = gid;
                changed = true;
            }
        }
        if changed {
            entry.last_metadata_change_time = Timespec::now();
        }
        Ok(changed)
    }

    pub fn update_modification_timestamp(&mut self, blob_id: &BlockId) -> Result<()> {
        let entry = self.get_mut_by_id(blob_id)?;
        let now = Timespec::now();
        entry.last_modification_time = now;
        entry.last_metadata_change_time = now;
        Ok(())
    }

    pub fn set_access_times(
        &mut self,
        blob_id: &BlockId,
        last_access_time: Timespec,
        last_modification_time: Timespec,
    ) -> Result<()> {
        let entry = self.get_mut_by_id(blob_id)?;
        entry.last_access_time = last_access_time;
        entry.last_modification_time = last_modification_time;
        entry.last_metadata_change_time = Timespec::now();
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn get_mut_by_id(&mut self, blob_id: &BlockId) -> Result<&mut DirEntry> {
        match self.entries.iter_mut().find(|e| &e.blob_id == blob_id) {
            Some(entry) => Ok(entry),
            None => return_errno_with_msg!(NotFound, "no entry with this blob id"),
        }
    }
}
