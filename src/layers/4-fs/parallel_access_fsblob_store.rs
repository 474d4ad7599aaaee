// SPDX-License-Identifier: MPL-2.0

use super::fsblob_store::{FsBlob, FsBlobStore};
use super::LstatSizeGetter;
use crate::layers::bio::{BlockId, BlockStore};
use crate::os::{Condvar, HashMap, Mutex};
use crate::prelude::*;

/// Coordinates concurrent access to fs blobs: at most one live
/// [`FsBlob`] exists per blob id, shared by all openers.
///
/// Concurrent `load` calls for the same id are deduplicated: the first
/// caller loads while the others wait on the entry's loading marker; the
/// map lock is never held across a block-store call, so loads of
/// unrelated ids proceed in parallel. An entry stays pinned until the
/// last handle drops, at which point the blob is flushed and released.
pub struct ParallelAccessFsBlobStore<B: BlockStore> {
    base: FsBlobStore<B>,
    open_blobs: Mutex<HashMap<BlockId, OpenBlob<B>>>,
    blob_released: Condvar,
}

enum OpenBlob<B: BlockStore> {
    /// Some thread is loading (or flushing out) this blob; wait.
    Busy,
    Open { blob: Arc<FsBlob<B>>, ref_count: u32 },
}

/// A reference-counted handle to a shared [`FsBlob`].
///
/// Dropping the handle releases it (flushing on last release, with
/// failures only logged); [`release`] does the same but surfaces the
/// error.
///
/// [`release`]: FsBlobRef::release
pub struct FsBlobRef<B: BlockStore> {
    store: Arc<ParallelAccessFsBlobStore<B>>,
    blob: Option<Arc<FsBlob<B>>>,
    id: BlockId,
}

impl<B: BlockStore> ParallelAccessFsBlobStore<B> {
    pub fn new(base: FsBlobStore<B>) -> Arc<Self> {
        Arc::new(Self {
            base,
            open_blobs: Mutex::new(HashMap::new()),
            blob_released: Condvar::new(),
        })
    }

    pub fn set_lstat_size_getter(&self, getter: LstatSizeGetter) {
        self.base.set_lstat_size_getter(getter);
    }

    pub fn create_file_blob(self: &Arc<Self>) -> Result<FsBlobRef<B>> {
        let blob = FsBlob::File(self.base.create_file_blob()?);
        Ok(self.install_new(blob))
    }

    pub fn create_dir_blob(self: &Arc<Self>) -> Result<FsBlobRef<B>> {
        let blob = FsBlob::Dir(self.base.create_dir_blob()?);
        Ok(self.install_new(blob))
    }

    pub fn create_symlink_blob(self: &Arc<Self>, target: &str) -> Result<FsBlobRef<B>> {
        let blob = FsBlob::Symlink(self.base.create_symlink_blob(target)?);
        Ok(self.install_new(blob))
    }

    /// Opens the blob with the given id, sharing an already-open blob if
    /// there is one.
    pub fn load(self: &Arc<Self>, id: &BlockId) -> Result<Option<FsBlobRef<B>>> {
        let mut open_blobs = self.open_blobs.lock();
        loop {
            match open_blobs.get_mut(id) {
                Some(OpenBlob::Open { blob, ref_count }) => {
                    *ref_count += 1;
                    return Ok(Some(self.handle(blob.clone(), *id)));
                }
                Some(OpenBlob::Busy) => {
                    open_blobs = self.blob_released.wait(open_blobs);
                }
                None => break,
            }
        }
        // We load; mark the id as busy so others wait instead of loading
        // the same blob a second time.
        open_blobs.insert(*id, OpenBlob::Busy);
        drop(open_blobs);

        let load_result = self.base.load(id);

        let mut open_blobs = self.open_blobs.lock();
        let result = match load_result {
            Ok(Some(blob)) => {
                let blob = Arc::new(blob);
                open_blobs.insert(
                    *id,
                    OpenBlob::Open {
                        blob: blob.clone(),
                        ref_count: 1,
                    },
                );
                Ok(Some(self.handle(blob, *id)))
            }
            Ok(None) => {
                open_blobs.remove(id);
                Ok(None)
            }
            Err(err) => {
                open_blobs.remove(id);
                Err(err)
            }
        };
        drop(open_blobs);
        self.blob_released.notify_all();
        result
    }

    /// Removes the blob behind `handle`, which must be the only handle.
    pub fn remove(self: &Arc<Self>, mut handle: FsBlobRef<B>) -> Result<()> {
        let id = handle.id;
        let shared = handle.blob.take().expect("handle already released");

        let is_sole_handle = {
            let mut open_blobs = self.open_blobs.lock();
            let is_sole =
                matches!(open_blobs.get(&id), Some(OpenBlob::Open { ref_count: 1, .. }));
            if is_sole {
                open_blobs.remove(&id);
            } else if let Some(OpenBlob::Open { ref_count, .. }) = open_blobs.get_mut(&id) {
                // The consumed handle gives up its reference either way.
                *ref_count -= 1;
            }
            is_sole
        };
        if !is_sole_handle {
            drop(shared);
            return_errno_with_msg!(UsageError, "blob is still open elsewhere");
        }
        self.blob_released.notify_all();

        let blob = Arc::try_unwrap(shared)
            .map_err(|_| Error::with_msg(UsageError, "blob is still referenced"))?;
        self.base.remove(blob)
    }

    /// Removes an unopened blob by id.
    pub fn remove_by_id(self: &Arc<Self>, id: &BlockId) -> Result<()> {
        {
            let open_blobs = self.open_blobs.lock();
            if open_blobs.contains_key(id) {
                return_errno_with_msg!(UsageError, "cannot remove a blob that is open");
            }
        }
        self.base.remove_by_id(id)
    }

    pub fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> Result<u64> {
        self.base.estimate_space_for_num_blocks_left()
    }

    pub fn virtual_block_size_bytes(&self) -> u32 {
        self.base.virtual_block_size_bytes()
    }

    fn install_new(self: &Arc<Self>, blob: FsBlob<B>) -> FsBlobRef<B> {
        let id = blob.blob_id();
        let blob = Arc::new(blob);
        let mut open_blobs = self.open_blobs.lock();
        let previous = open_blobs.insert(
            id,
            OpenBlob::Open {
                blob: blob.clone(),
                ref_count: 1,
            },
        );
        debug_assert!(previous.is_none(), "fresh blob id collided with an open blob");
        drop(open_blobs);
        self.handle(blob, id)
    }

    fn handle(self: &Arc<Self>, blob: Arc<FsBlob<B>>, id: BlockId) -> FsBlobRef<B> {
        FsBlobRef {
            store: self.clone(),
            blob: Some(blob),
            id,
        }
    }

    /// Drops one reference; the last one flushes the blob and evicts the
    /// entry.
    fn release(&self, id: &BlockId) -> Result<()> {
        let mut open_blobs = self.open_blobs.lock();
        let Some(OpenBlob::Open { blob, ref_count }) = open_blobs.get_mut(id) else {
            debug_assert!(false, "released a blob that is not open");
            return Ok(());
        };
        if *ref_count > 1 {
            *ref_count -= 1;
            return Ok(());
        }
        // Last reference: flush outside the map lock, with the entry
        // marked busy so a concurrent load waits for the flush instead
        // of reading stale blocks.
        let blob = blob.clone();
        open_blobs.insert(*id, OpenBlob::Busy);
        drop(open_blobs);

        let flush_result = blob.flush();
        drop(blob);

        self.open_blobs.lock().remove(id);
        self.blob_released.notify_all();
        flush_result
    }
}

impl<B: BlockStore> FsBlobRef<B> {
    pub fn blob_id(&self) -> &BlockId {
        &self.id
    }

    /// Releases the handle, surfacing a flush failure on last release.
    pub fn release(mut self) -> Result<()> {
        self.blob.take().expect("handle already released");
        self.store.release(&self.id)
    }
}

impl<B: BlockStore> std::ops::Deref for FsBlobRef<B> {
    type Target = FsBlob<B>;

    fn deref(&self) -> &FsBlob<B> {
        self.blob.as_ref().expect("handle already released")
    }
}

impl<B: BlockStore> Drop for FsBlobRef<B> {
    fn drop(&mut self) {
        if self.blob.take().is_some() {
            if let Err(err) = self.store.release(&self.id) {
                error!("failed to flush blob {} on release: {}", self.id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use super::*;
    use crate::layers::bio::{BlockStore, InMemoryBlockStore};
    use crate::layers::blob::BlobStoreOnBlocks;

    /// Counts loads going through to the backend.
    struct CountingBlockStore {
        base: InMemoryBlockStore,
        loads: AtomicUsize,
    }

    impl CountingBlockStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: InMemoryBlockStore::new(),
                loads: AtomicUsize::new(0),
            })
        }
    }

    impl BlockStore for CountingBlockStore {
        fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
            self.base.try_create(id, data)
        }
        fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            self.base.load(id)
        }
        fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
            self.base.store(id, data)
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
        fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
            self.base.block_size_from_physical_block_size(physical)
        }
        fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId) -> Result<()>) -> Result<()> {
            self.base.for_each_block(callback)
        }
    }

    fn store_on(
        base: Arc<CountingBlockStore>,
    ) -> Arc<ParallelAccessFsBlobStore<Arc<CountingBlockStore>>> {
        let fs_store =
            FsBlobStore::new(BlobStoreOnBlocks::new(base, 1024).unwrap());
        let store = ParallelAccessFsBlobStore::new(fs_store);
        store.set_lstat_size_getter(Arc::new(|_id| Ok(0)));
        store
    }

    #[test]
    fn handles_for_the_same_id_share_one_blob() {
        let store = store_on(CountingBlockStore::new());
        let file = store.create_file_blob().unwrap();
        let id = *file.blob_id();
        file.release().unwrap();

        let handle1 = store.load(&id).unwrap().unwrap();
        let handle2 = store.load(&id).unwrap().unwrap();
        assert!(Arc::ptr_eq(
            handle1.blob.as_ref().unwrap(),
            handle2.blob.as_ref().unwrap()
        ));

        // A write through one handle is visible through the other
        // without any flush.
        handle1.as_file().unwrap().write(0, b"shared").unwrap();
        let mut data = [0u8; 6];
        assert_eq!(handle2.as_file().unwrap().read(0, &mut data).unwrap(), 6);
        assert_eq!(&data, b"shared");

        handle1.release().unwrap();
        handle2.release().unwrap();
        assert!(store.open_blobs.lock().is_empty());
    }

    #[test]
    fn open_blob_is_loaded_only_once() {
        let base = CountingBlockStore::new();
        let store = store_on(base.clone());
        let file = store.create_file_blob().unwrap();
        let id = *file.blob_id();
        file.release().unwrap();

        let before = base.loads.load(Ordering::Relaxed);
        let handle1 = store.load(&id).unwrap().unwrap();
        let after_first = base.loads.load(Ordering::Relaxed);
        assert!(after_first > before);

        // The second open finds the entry and never reaches the backend.
        let handle2 = store.load(&id).unwrap().unwrap();
        assert_eq!(base.loads.load(Ordering::Relaxed), after_first);
        handle1.release().unwrap();
        handle2.release().unwrap();
    }

    #[test]
    fn parallel_opens_share_one_load() {
        let base = CountingBlockStore::new();
        let store = store_on(base.clone());
        let file = store.create_file_blob().unwrap();
        let id = *file.blob_id();
        file.release().unwrap();

        let num_threads = 8;
        let barrier = Arc::new(Barrier::new(num_threads));
        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let handle = store.load(&id).unwrap().unwrap();
                    let ptr = Arc::as_ptr(handle.blob.as_ref().unwrap()) as usize;
                    handle.release().unwrap();
                    ptr
                })
            })
            .collect();

        let pointers: Vec<usize> = handles.into_iter().map(|t| t.join().unwrap()).collect();
        // Whenever opens overlapped they shared one blob; and afterwards
        // nothing stays pinned.
        assert!(store.open_blobs.lock().is_empty());
        assert!(!pointers.is_empty());
    }

    #[test]
    fn released_blob_is_flushed_and_reloadable() {
        let base = CountingBlockStore::new();
        let store = store_on(base.clone());
        let file = store.create_file_blob().unwrap();
        let id = *file.blob_id();
        file.as_file().unwrap().write(0, b"persisted").unwrap();
        file.release().unwrap();

        let reloaded = store.load(&id).unwrap().unwrap();
        let mut data = [0u8; 9];
        assert_eq!(reloaded.as_file().unwrap().read(0, &mut data).unwrap(), 9);
        assert_eq!(&data, b"persisted");
        reloaded.release().unwrap();
    }

    #[test]
    fn load_missing_blob_is_none() {
        let store = store_on(CountingBlockStore::new());
        assert!(store.load(&BlockId::random()).unwrap().is_none());
        // The busy marker is cleaned up.
        assert!(store.open_blobs.lock().is_empty());
    }

    #[test]
    fn remove_requires_the_sole_handle() {
        let store = store_on(CountingBlockStore::new());
        let file = store.create_file_blob().unwrap();
        let id = *file.blob_id();

        let second = store.load(&id).unwrap().unwrap();
        let err = store.remove(file).unwrap_err();
        assert_eq!(err.errno(), UsageError);

        // With only one handle left, removal works.
        store.remove(second).unwrap();
        assert!(store.load(&id).unwrap().is_none());
        assert_eq!(store.num_blocks().unwrap(), 0);
    }

    #[test]
    fn remove_by_id_refuses_open_blobs() {
        let store = store_on(CountingBlockStore::new());
        let file = store.create_file_blob().unwrap();
        let id = *file.blob_id();
        assert_eq!(store.remove_by_id(&id).unwrap_err().errno(), UsageError);
        file.release().unwrap();
        store.remove_by_id(&id).unwrap();
    }
}
