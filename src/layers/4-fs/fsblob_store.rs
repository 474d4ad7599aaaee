// SPDX-License-Identifier: MPL-2.0

use super::dir_blob::{DirBlob, LstatSizeGetter};
use super::dir_entries::EntryType;
use super::file_blob::FileBlob;
use super::symlink_blob::SymlinkBlob;
use super::{MAGIC_DIR, MAGIC_FILE, MAGIC_SYMLINK};
use crate::layers::bio::{BlockId, BlockStore};
use crate::layers::blob::BlobStoreOnBlocks;
use crate::os::Mutex;
use crate::prelude::*;

/// A typed blob loaded from the store, discriminated by the type magic.
#[derive(Debug)]
pub enum FsBlob<B: BlockStore> {
    Dir(DirBlob<B>),
    File(FileBlob<B>),
    Symlink(SymlinkBlob<B>),
}

impl<B: BlockStore> FsBlob<B> {
    pub fn blob_id(&self) -> BlockId {
        match self {
            FsBlob::Dir(dir) => dir.blob_id(),
            FsBlob::File(file) => file.blob_id(),
            FsBlob::Symlink(symlink) => symlink.blob_id(),
        }
    }

    pub fn blob_type(&self) -> EntryType {
        match self {
            FsBlob::Dir(_) => EntryType::Dir,
            FsBlob::File(_) => EntryType::File,
            FsBlob::Symlink(_) => EntryType::Symlink,
        }
    }

    /// The size a stat call reports for this blob.
    pub fn lstat_size(&self) -> Result<u64> {
        match self {
            FsBlob::Dir(dir) => Ok(dir.lstat_size()),
            FsBlob::File(file) => file.lstat_size(),
            FsBlob::Symlink(symlink) => Ok(symlink.lstat_size()),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self {
            FsBlob::Dir(dir) => dir.flush(),
            FsBlob::File(file) => file.flush(),
            FsBlob::Symlink(symlink) => symlink.flush(),
        }
    }

    pub fn as_dir(&self) -> Result<&DirBlob<B>> {
        match self {
            FsBlob::Dir(dir) => Ok(dir),
            _ => return_errno_with_msg!(UsageError, "blob is not a directory"),
        }
    }

    pub fn as_file(&self) -> Result<&FileBlob<B>> {
        match self {
            FsBlob::File(file) => Ok(file),
            _ => return_errno_with_msg!(UsageError, "blob is not a file"),
        }
    }

    pub fn as_symlink(&self) -> Result<&SymlinkBlob<B>> {
        match self {
            FsBlob::Symlink(symlink) => Ok(symlink),
            _ => return_errno_with_msg!(UsageError, "blob is not a symlink"),
        }
    }
}

/// Creates and opens typed blobs on a blob store.
pub struct FsBlobStore<B: BlockStore> {
    blob_store: BlobStoreOnBlocks<B>,
    /// Injected by the device once the full store stack stands; resolves
    /// child sizes for directory stat calls.
    lstat_size_getter: Mutex<Option<LstatSizeGetter>>,
}

impl<B: BlockStore> std::fmt::Debug for FsBlobStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsBlobStore").finish_non_exhaustive()
    }
}

impl<B: BlockStore> FsBlobStore<B> {
    pub fn new(blob_store: BlobStoreOnBlocks<B>) -> Self {
        Self {
            blob_store,
            lstat_size_getter: Mutex::new(None),
        }
    }

    pub fn set_lstat_size_getter(&self, getter: LstatSizeGetter) {
        *self.lstat_size_getter.lock() = Some(getter);
    }

    pub fn create_file_blob(&self) -> Result<FileBlob<B>> {
        FileBlob::create(self.blob_store.create()?)
    }

    pub fn create_dir_blob(&self) -> Result<DirBlob<B>> {
        DirBlob::create_empty(self.blob_store.create()?, self.lstat_size_getter()?)
    }

    pub fn create_symlink_blob(&self, target: &str) -> Result<SymlinkBlob<B>> {
        SymlinkBlob::create(self.blob_store.create()?, target)
    }

    /// Loads the blob with the given id and types it by its magic.
    pub fn load(&self, id: &BlockId) -> Result<Option<FsBlob<B>>> {
        let Some(mut blob) = self.blob_store.load(id)? else {
            return Ok(None);
        };
        let mut magic = [0u8; 1];
        if blob.try_read(0, &mut magic)? != 1 {
            return_errno_with_msg!(CorruptedStorage, "blob has no type magic");
        }
        match magic[0] {
            MAGIC_DIR => Ok(Some(FsBlob::Dir(DirBlob::load(
                blob,
                self.lstat_size_getter()?,
            )?))),
            MAGIC_FILE => Ok(Some(FsBlob::File(FileBlob::load(blob)?))),
            MAGIC_SYMLINK => Ok(Some(FsBlob::Symlink(SymlinkBlob::load(blob)?))),
            _ => return_errno_with_msg!(CorruptedStorage, "blob has an unknown type magic"),
        }
    }

    /// Removes a loaded blob and all its blocks.
    pub fn remove(&self, blob: FsBlob<B>) -> Result<()> {
        let blob = match blob {
            FsBlob::Dir(dir) => dir.into_blob(),
            FsBlob::File(file) => file.into_blob(),
            FsBlob::Symlink(symlink) => symlink.into_blob(),
        };
        self.blob_store.remove(blob)
    }

    /// Removes the blob with the given id.
    pub fn remove_by_id(&self, id: &BlockId) -> Result<()> {
        self.blob_store.remove_by_id(id)
    }

    pub fn num_blocks(&self) -> Result<u64> {
        self.blob_store.num_nodes()
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> Result<u64> {
        self.blob_store.estimate_space_for_num_blocks_left()
    }

    pub fn virtual_block_size_bytes(&self) -> u32 {
        self.blob_store.virtual_block_size_bytes()
    }

    pub fn flush(&self) -> Result<()> {
        self.blob_store.flush()
    }

    fn lstat_size_getter(&self) -> Result<LstatSizeGetter> {
        match self.lstat_size_getter.lock().as_ref() {
            Some(getter) => Ok(getter.clone()),
            None => return_errno_with_msg!(
                UsageError,
                "no lstat size getter was injected into the blob store"
            ),
        }
    }
}
