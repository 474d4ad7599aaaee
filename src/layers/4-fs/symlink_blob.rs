// SPDX-License-Identifier: MPL-2.0

use super::MAGIC_SYMLINK;
use crate::layers::bio::{BlockId, BlockStore};
use crate::layers::blob::Blob;
use crate::os::Mutex;
use crate::prelude::*;

/// A symlink blob: the type magic followed by the UTF-8 target path.
///
/// Symlinks are immutable once created; changing a link means replacing
/// the blob.
#[derive(Debug)]
pub struct SymlinkBlob<B> {
    blob: Mutex<Blob<B>>,
    target: String,
}

impl<B: BlockStore> SymlinkBlob<B> {
    /// Initializes a fresh blob as a symlink to `target`.
    pub(super) fn create(mut blob: Blob<B>, target: &str) -> Result<Self> {
        blob.resize(1 + target.len() as u64)?;
        blob.write(0, &[MAGIC_SYMLINK])?;
        blob.write(1, target.as_bytes())?;
        Ok(Self {
            blob: Mutex::new(blob),
            target: target.to_string(),
        })
    }

    /// Opens an existing symlink blob and reads its target.
    pub(super) fn load(mut blob: Blob<B>) -> Result<Self> {
        let data = blob.read_all()?;
        let Some((&magic, target_bytes)) = data.split_first() else {
            return_errno_with_msg!(CorruptedStorage, "symlink blob is empty");
        };
        if magic != MAGIC_SYMLINK {
            return_errno_with_msg!(UsageError, "loaded blob is not a symlink");
        }
        let target = std::str::from_utf8(target_bytes)
            .map_err(|_| Error::with_msg(CorruptedStorage, "symlink target is not valid UTF-8"))?
            .to_string();
        Ok(Self {
            blob: Mutex::new(blob),
            target,
        })
    }

    pub fn blob_id(&self) -> BlockId {
        *self.blob.lock().id()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn lstat_size(&self) -> u64 {
        self.target.len() as u64
    }

    pub fn flush(&self) -> Result<()> {
        self.blob.lock().flush()
    }

    pub(super) fn into_blob(self) -> Blob<B> {
        self.blob.into_inner()
    }
}
