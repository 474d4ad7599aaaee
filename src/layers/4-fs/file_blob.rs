// SPDX-License-Identifier: MPL-2.0

use super::MAGIC_FILE;
use crate::layers::bio::{BlockId, BlockStore};
use crate::layers::blob::Blob;
use crate::os::Mutex;
use crate::prelude::*;

/// A file blob: the type magic followed by the raw file bytes.
///
/// A thin adapter over [`Blob`] that shifts every offset by one for the
/// magic byte. The internal mutex makes a shared `FileBlob` safe to use
/// from concurrent openers; byte-range operations are individually
/// atomic, nothing more.
#[derive(Debug)]
pub struct FileBlob<B> {
    blob: Mutex<Blob<B>>,
}

impl<B: BlockStore> FileBlob<B> {
    /// Initializes a fresh blob as an empty file.
    pub(super) fn create(mut blob: Blob<B>) -> Result<Self> {
        blob.resize(1)?;
        blob.write(0, &[MAGIC_FILE])?;
        Ok(Self {
            blob: Mutex::new(blob),
        })
    }

    /// Opens an existing file blob.
    pub(super) fn load(mut blob: Blob<B>) -> Result<Self> {
        let mut magic = [0u8; 1];
        if blob.try_read(0, &mut magic)? != 1 {
            return_errno_with_msg!(CorruptedStorage, "file blob is empty");
        }
        if magic[0] != MAGIC_FILE {
            return_errno_with_msg!(UsageError, "loaded blob is not a file");
        }
        Ok(Self {
            blob: Mutex::new(blob),
        })
    }

    pub fn blob_id(&self) -> BlockId {
        *self.blob.lock().id()
    }

    pub fn num_bytes(&self) -> Result<u64> {
        Ok(self.blob.lock().num_bytes()? - 1)
    }

    pub fn lstat_size(&self) -> Result<u64> {
        self.num_bytes()
    }

    /// Reads up to `target.len()` bytes at `offset`, returning how many
    /// were available.
    pub fn read(&self, offset: u64, target: &mut [u8]) -> Result<usize> {
        self.blob.lock().try_read(offset + 1, target)
    }

    /// Writes at `offset`, growing the file as needed.
    pub fn write(&self, offset: u64, source: &[u8]) -> Result<()> {
        self.blob.lock().write(offset + 1, source)
    }

    /// Truncates or zero-extends the file to `new_num_bytes`.
    pub fn resize(&self, new_num_bytes: u64) -> Result<()> {
        self.blob.lock().resize(new_num_bytes + 1)
    }

    pub fn flush(&self) -> Result<()> {
        self.blob.lock().flush()
    }

    pub(super) fn into_blob(self) -> Blob<B> {
        self.blob.into_inner()
    }
}
