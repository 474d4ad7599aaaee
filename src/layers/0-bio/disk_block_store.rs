// SPDX-License-Identifier: MPL-2.0

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{BlockId, BlockStore};
use crate::prelude::*;

/// A block store backed by a directory of files.
///
/// Each block is one file holding exactly the stored bytes. The filename
/// is the 32-char uppercase hex block id, split into a two-char prefix
/// directory for fanout:
///
/// ```text
/// <root>/
/// └── AB/
///     └── CDEF0123456789ABCDEF0123456789  # remaining 30 hex chars
/// ```
pub struct OnDiskBlockStore {
    root: PathBuf,
}

impl OnDiskBlockStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn block_path(&self, id: &BlockId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl BlockStore for OnDiskBlockStore {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<bool> {
        let path = self.block_path(id);
        fs::create_dir_all(path.parent().expect("block path always has a parent"))?;
        let result = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);
        match result {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                file.write_all(data)?;
                file.sync_data()?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.block_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        let path = self.block_path(id);
        fs::create_dir_all(path.parent().expect("block path always has a parent"))?;
        fs::write(&path, data)?;
        Ok(())
    }

    fn remove(&self, id: &BlockId) -> Result<bool> {
        match fs::remove_file(self.block_path(id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn num_blocks(&self) -> Result<u64> {
        let mut count = 0u64;
        self.for_each_block(&mut |_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        estimate_free_bytes(&self.root)
    }

    fn block_size_from_physical_block_size(&self, physical_block_size: u64) -> Result<u64> {
        Ok(physical_block_size)
    }

    fn for_each_block(&self, callback: &mut dyn FnMut(&BlockId) -> Result<()>) -> Result<()> {
        let top = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for prefix_entry in top {
            let prefix_entry = prefix_entry?;
            if !prefix_entry.file_type()?.is_dir() {
                continue;
            }
            let prefix_name = prefix_entry.file_name();
            let Some(prefix) = valid_name(&prefix_name, 2) else {
                continue;
            };
            for block_entry in fs::read_dir(prefix_entry.path())? {
                let block_entry = block_entry?;
                let block_name = block_entry.file_name();
                let Some(rest) = valid_name(&block_name, BlockId::STRING_LEN - 2) else {
                    continue;
                };
                let Ok(id) = BlockId::from_hex(&format!("{prefix}{rest}")) else {
                    continue;
                };
                callback(&id)?;
            }
        }
        Ok(())
    }
}

fn valid_name(name: &std::ffi::OsStr, expected_len: usize) -> Option<&str> {
    let name = name.to_str()?;
    (name.len() == expected_len && name.bytes().all(|b| b.is_ascii_hexdigit())).then_some(name)
}

fn estimate_free_bytes(path: &Path) -> Result<u64> {
    use std::os::unix::ffi::OsStrExt;
    let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::with_msg(InvalidArgs, "store path contains a NUL byte"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(stat.f_bavail as u64 * stat.f_bsize as u64)
}
