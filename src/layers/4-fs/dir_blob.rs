// SPDX-License-Identifier: MPL-2.0

use super::dir_entries::{DirEntry, DirEntryList, EntryType, Timespec};
use super::MAGIC_DIR;
use crate::layers::bio::{BlockId, BlockStore};
use crate::layers::blob::Blob;
use crate::os::Mutex;
use crate::prelude::*;

/// Size reported for directories in stat calls.
pub const DIR_LSTAT_SIZE: u64 = 4096;

/// Resolves a blob id to the size its stat entry should report, without
/// the directory having to load the child blob itself. Supplied by the
/// device, which can consult already-open blobs.
pub type LstatSizeGetter = Arc<dyn Fn(&BlockId) -> Result<u64> + Send + Sync>;

/// A directory blob: the type magic followed by the serialized entry
/// table.
///
/// The table is held in memory, mutated there, and re-serialized into
/// the blob on [`flush`] (or on drop, where a failure can only be
/// logged). The internal mutex makes a shared `DirBlob` safe to use
/// from concurrent openers.
///
/// [`flush`]: DirBlob::flush
pub struct DirBlob<B: BlockStore> {
    inner: Mutex<Inner<B>>,
}

impl<B: BlockStore> std::fmt::Debug for DirBlob<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirBlob").finish_non_exhaustive()
    }
}

struct Inner<B> {
    /// `None` only after `into_blob` handed the blob out for removal.
    blob: Option<Blob<B>>,
    entries: DirEntryList,
    lstat_size_getter: LstatSizeGetter,
    changed: bool,
}

/// Attributes of a directory child, as a stat call reports them.
#[derive(Clone, Debug)]
pub struct NodeAttrs {
    pub entry_type: EntryType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub num_links: u32,
    pub num_bytes: u64,
    pub last_access_time: Timespec,
    pub last_modification_time: Timespec,
    pub last_metadata_change_time: Timespec,
}

impl<B: BlockStore> DirBlob<B> {
    /// Initializes a fresh blob as an empty directory.
    pub(super) fn create_empty(
        mut blob: Blob<B>,
        lstat_size_getter: LstatSizeGetter,
    ) -> Result<Self> {
        blob.resize(1)?;
        blob.write(0, &[MAGIC_DIR])?;
        Ok(Self {
            inner: Mutex::new(Inner {
                blob: Some(blob),
                entries: DirEntryList::new_empty(),
                lstat_size_getter,
                changed: false,
            }),
        })
    }

    /// Opens an existing directory blob and reads its entry table.
    pub(super) fn load(mut blob: Blob<B>, lstat_size_getter: LstatSizeGetter) -> Result<Self> {
        let data = blob.read_all()?;
        let Some((&magic, entry_data)) = data.split_first() else {
            return_errno_with_msg!(CorruptedStorage, "directory blob is empty");
        };
        if magic != MAGIC_DIR {
            return_errno_with_msg!(UsageError, "loaded blob is not a directory");
        }
        let entries = DirEntryList::deserialize(entry_data)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                blob: Some(blob),
                entries,
                lstat_size_getter,
                changed: false,
            }),
        })
    }

    pub fn blob_id(&self) -> BlockId {
        *self.inner.lock().blob.as_ref().expect("blob taken").id()
    }

    pub fn lstat_size(&self) -> u64 {
        DIR_LSTAT_SIZE
    }

    pub fn add_child_dir(
        &self,
        name: &str,
        blob_id: BlockId,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        self.add_child(name, blob_id, EntryType::Dir, mode, uid, gid)
    }

    pub fn add_child_file(
        &self,
        name: &str,
        blob_id: BlockId,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        self.add_child(name, blob_id, EntryType::File, mode, uid, gid)
    }

    pub fn add_child_symlink(&self, name: &str, blob_id: BlockId, uid: u32, gid: u32) -> Result<()> {
        self.add_child(name, blob_id, EntryType::Symlink, 0o777, uid, gid)
    }

    fn add_child(
        &self,
        name: &str,
        blob_id: BlockId,
        entry_type: EntryType,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return_errno_with_msg!(InvalidArgs, "invalid entry name length");
        }
        let now = Timespec::now();
        let mut inner = self.inner.lock();
        inner.entries.add(DirEntry {
            entry_type,
            name: name.to_string(),
            blob_id,
            mode,
            uid,
            gid,
            last_access_time: now,
            last_modification_time: now,
            last_metadata_change_time: now,
        })?;
        inner.changed = true;
        Ok(())
    }

    pub fn get_child(&self, name: &str) -> Option<DirEntry> {
        self.inner.lock().entries.get(name).cloned()
    }

    pub fn get_child_by_id(&self, blob_id: &BlockId) -> Option<DirEntry> {
        self.inner.lock().entries.get_by_id(blob_id).cloned()
    }

    pub fn remove_child_by_name(&self, name: &str) -> Result<DirEntry> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove_by_name(name)?;
        inner.changed = true;
        Ok(removed)
    }

    pub fn remove_child_by_id(&self, blob_id: &BlockId) -> Result<DirEntry> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove_by_id(blob_id)?;
        inner.changed = true;
        Ok(removed)
    }

    pub fn set_mode_of_child(&self, blob_id: &BlockId, mode: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.set_mode(blob_id, mode)?;
        inner.changed = true;
        Ok(())
    }

    pub fn set_uid_gid_of_child(
        &self,
        blob_id: &BlockId,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.set_uid_gid(blob_id, uid, gid)? {
            inner.changed = true;
        }
        Ok(())
    }

    /// Marks the child as modified just now, e.g. after a file write.
    pub fn update_modification_timestamp_of_child(&self, blob_id: &BlockId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.update_modification_timestamp(blob_id)?;
        inner.changed = true;
        Ok(())
    }

    pub fn set_access_times_of_child(
        &self,
        blob_id: &BlockId,
        last_access_time: Timespec,
        last_modification_time: Timespec,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .entries
            .set_access_times(blob_id, last_access_time, last_modification_time)?;
        inner.changed = true;
        Ok(())
    }

    /// Appends `(type, name)` of every child, in name order.
    pub fn append_children_to(&self, result: &mut Vec<(EntryType, String)>) {
        let inner = self.inner.lock();
        result.reserve(inner.entries.len());
        for entry in inner.entries.iter() {
            result.push((entry.entry_type, entry.name.clone()));
        }
    }

    pub fn num_children(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Stat attributes of the child with the given blob id. The size
    /// comes from the injected [`LstatSizeGetter`].
    pub fn stat_child(&self, blob_id: &BlockId) -> Result<NodeAttrs> {
        let (entry, getter) = {
            let inner = self.inner.lock();
            let Some(entry) = inner.entries.get_by_id(blob_id).cloned() else {
                return_errno_with_msg!(NotFound, "no entry with this blob id");
            };
            (entry, inner.lstat_size_getter.clone())
        };
        // The getter may load the child blob; the own lock is already
        // released here so that cannot deadlock with openers of `self`.
        let num_bytes = getter(blob_id)?;
        Ok(NodeAttrs {
            entry_type: entry.entry_type,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            num_links: 1,
            num_bytes,
            last_access_time: entry.last_access_time,
            last_modification_time: entry.last_modification_time,
            last_metadata_change_time: entry.last_metadata_change_time,
        })
    }

    /// Serializes the entry table into the blob if it changed, and
    /// flushes the blob.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::write_entries_if_changed(&mut inner)?;
        inner.blob.as_mut().expect("blob taken").flush()
    }

    /// Hands out the underlying blob, e.g. for removal. Pending entry
    /// changes are dropped deliberately; the blob is about to die.
    pub(super) fn into_blob(self) -> Blob<B> {
        let mut inner = self.inner.lock();
        inner.changed = false;
        inner.blob.take().expect("blob taken")
    }

    fn write_entries_if_changed(inner: &mut Inner<B>) -> Result<()> {
        if inner.changed {
            let serialized = inner.entries.serialize();
            let blob = inner.blob.as_mut().expect("blob taken");
            blob.resize(1 + serialized.len() as u64)?;
            blob.write(1, &serialized)?;
            inner.changed = false;
        }
        Ok(())
    }
}

impl<B: BlockStore> Drop for DirBlob<B> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.changed && inner.blob.is_some() {
            // Last-resort write; the explicit flush path exists for
            // callers that need the error.
            if let Err(err) = Self::write_entries_if_changed(&mut inner) {
                error!(
                    "failed to write back entries of directory blob {}: {}",
                    inner.blob.as_ref().expect("blob taken").id(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::InMemoryBlockStore;
    use crate::layers::blob::BlobStoreOnBlocks;

    fn blob_store() -> BlobStoreOnBlocks<InMemoryBlockStore> {
        BlobStoreOnBlocks::new(InMemoryBlockStore::new(), 1024).unwrap()
    }

    fn lstat_getter() -> LstatSizeGetter {
        Arc::new(|_id| Ok(42))
    }

    #[test]
    fn empty_dir_roundtrips() {
        let store = blob_store();
        let dir = DirBlob::create_empty(store.create().unwrap(), lstat_getter()).unwrap();
        let id = dir.blob_id();
        dir.flush().unwrap();
        drop(dir);

        let loaded =
            DirBlob::load(store.load(&id).unwrap().unwrap(), lstat_getter()).unwrap();
        assert_eq!(loaded.num_children(), 0);
    }

    #[test]
    fn children_survive_flush_and_reload() {
        let store = blob_store();
        let dir = DirBlob::create_empty(store.create().unwrap(), lstat_getter()).unwrap();
        let id = dir.blob_id();
        let file_id = BlockId::random();
        let subdir_id = BlockId::random();
        let link_id = BlockId::random();
        dir.add_child_file("file.txt", file_id, 0o644, 1000, 1000).unwrap();
        dir.add_child_dir("subdir", subdir_id, 0o755, 1000, 1000).unwrap();
        dir.add_child_symlink("link", link_id, 1000, 1000).unwrap();
        dir.flush().unwrap();
        drop(dir);

        let loaded =
            DirBlob::load(store.load(&id).unwrap().unwrap(), lstat_getter()).unwrap();
        assert_eq!(loaded.num_children(), 3);
        let entry = loaded.get_child("file.txt").unwrap();
        assert_eq!(entry.blob_id, file_id);
        assert_eq!(entry.entry_type, EntryType::File);
        assert_eq!(entry.mode, 0o644);
        assert_eq!(loaded.get_child_by_id(&subdir_id).unwrap().name, "subdir");

        let mut children = Vec::new();
        loaded.append_children_to(&mut children);
        let names: Vec<&str> = children.iter().map(|(_, name)| name.as_str()).collect();
        assert_eq!(names, ["file.txt", "link", "subdir"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let store = blob_store();
        let dir = DirBlob::create_empty(store.create().unwrap(), lstat_getter()).unwrap();
        dir.add_child_file("name", BlockId::random(), 0o644, 0, 0).unwrap();
        let err = dir
            .add_child_dir("name", BlockId::random(), 0o755, 0, 0)
            .unwrap_err();
        assert_eq!(err.errno(), AlreadyExists);
        dir.flush().unwrap();
    }

    #[test]
    fn remove_child_shrinks_the_blob() {
        let store = blob_store();
        let dir = DirBlob::create_empty(store.create().unwrap(), lstat_getter()).unwrap();
        let id = dir.blob_id();
        let child = BlockId::random();
        dir.add_child_file("a", child, 0o644, 0, 0).unwrap();
        dir.add_child_file("b", BlockId::random(), 0o644, 0, 0).unwrap();
        dir.flush().unwrap();

        dir.remove_child_by_id(&child).unwrap();
        dir.remove_child_by_name("b").unwrap();
        dir.flush().unwrap();
        drop(dir);

        let loaded =
            DirBlob::load(store.load(&id).unwrap().unwrap(), lstat_getter()).unwrap();
        assert_eq!(loaded.num_children(), 0);
    }

    #[test]
    fn stat_child_uses_the_injected_size() {
        let store = blob_store();
        let dir = DirBlob::create_empty(store.create().unwrap(), lstat_getter()).unwrap();
        let child = BlockId::random();
        dir.add_child_file("f", child, 0o640, 7, 8).unwrap();

        let attrs = dir.stat_child(&child).unwrap();
        assert_eq!(attrs.num_bytes, 42);
        assert_eq!(attrs.mode, 0o640);
        assert_eq!(attrs.uid, 7);
        assert_eq!(attrs.gid, 8);
        assert_eq!(attrs.num_links, 1);
        dir.flush().unwrap();

        assert_eq!(dir.stat_child(&BlockId::random()).unwrap_err().errno(), NotFound);
    }

    #[test]
    fn metadata_updates_are_persisted() {
        let store = blob_store();
        let dir = DirBlob::create_empty(store.create().unwrap(), lstat_getter()).unwrap();
        let id = dir.blob_id();
        let child = BlockId::random();
        dir.add_child_file("f", child, 0o644, 0, 0).unwrap();
        dir.set_mode_of_child(&child, 0o600).unwrap();
        dir.set_uid_gid_of_child(&child, Some(5), Some(6)).unwrap();
        dir.set_access_times_of_child(
            &child,
            Timespec { secs: 1, nanos: 0 },
            Timespec { secs: 2, nanos: 0 },
        )
        .unwrap();
        dir.flush().unwrap();
        drop(dir);

        let loaded =
            DirBlob::load(store.load(&id).unwrap().unwrap(), lstat_getter()).unwrap();
        let entry = loaded.get_child_by_id(&child).unwrap();
        assert_eq!(entry.mode, 0o600);
        assert_eq!(entry.uid, 5);
        assert_eq!(entry.gid, 6);
        assert_eq!(entry.last_access_time, Timespec { secs: 1, nanos: 0 });
        assert_eq!(entry.last_modification_time, Timespec { secs: 2, nanos: 0 });
    }

    #[test]
    fn loading_a_file_blob_as_dir_fails() {
        let store = blob_store();
        let mut blob = store.create().unwrap();
        blob.write(0, &[super::super::MAGIC_FILE]).unwrap();
        let id = *blob.id();
        drop(blob);

        let err = DirBlob::load(store.load(&id).unwrap().unwrap(), lstat_getter()).unwrap_err();
        assert_eq!(err.errno(), UsageError);
    }
}
