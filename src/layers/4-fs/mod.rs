// SPDX-License-Identifier: MPL-2.0

//! The layer of typed filesystem blobs.
//!
//! Every blob gets a one-byte type magic as its first payload byte:
//! `0x00` directory, `0x01` file, `0x02` symlink. Directory blobs hold a
//! serialized entry table, file blobs hold the file bytes, symlink
//! blobs hold the target path. [`ParallelAccessFsBlobStore`] sits on
//! top and guarantees at most one live blob object per id, shared by
//! all concurrent openers.

mod dir_blob;
mod dir_entries;
mod file_blob;
mod fsblob_store;
mod parallel_access_fsblob_store;
mod symlink_blob;

pub use self::{
    dir_blob::{DirBlob, LstatSizeGetter, NodeAttrs, DIR_LSTAT_SIZE},
    dir_entries::{DirEntry, EntryType, Timespec},
    file_blob::FileBlob,
    fsblob_store::{FsBlob, FsBlobStore},
    parallel_access_fsblob_store::{FsBlobRef, ParallelAccessFsBlobStore},
    symlink_blob::SymlinkBlob,
};

const MAGIC_DIR: u8 = 0x00;
const MAGIC_FILE: u8 = 0x01;
const MAGIC_SYMLINK: u8 = 0x02;
