// SPDX-License-Identifier: MPL-2.0

//! A cryptographic filesystem core that stores all user data as
//! fixed-size, individually encrypted, authenticated blocks on an
//! untrusted backend.
//!
//! An observer of the raw storage learns only the count and size class
//! of blocks. They cannot distinguish files from directories, infer
//! structure, or mutate, rename, reorder, replay, or delete blocks
//! without detection.
//!
//! The crate is organized as a stack of layers:
//!
//! 1. **bio** — a key-addressed store of opaque fixed-size blocks, with
//!    in-memory and directory-of-files backends.
//! 2. **crypto** — authenticated encryption per block, polymorphic over
//!    the cipher, with page-locked key handling.
//! 3. **integrity** — per-block writer ids and monotonic version
//!    counters, checked against a persistent local table to defeat
//!    rollback, re-introduction, swap, and deletion attacks.
//! 4. **blob** — a balanced fixed-fanout left-max-data node tree that
//!    composes blocks into variable-length blobs with random access.
//! 5. **fsblob** — typed blobs (directory, file, symlink) plus a
//!    coordinator guaranteeing at most one live blob object per id
//!    across concurrent openers.
//!
//! [`Device`] wires the whole stack together from the configuration
//! essentials: cipher, key, block size, and root blob id.
//!
//! # Example
//!
//! ```no_run
//! use veilfs::{Aes256Gcm, Device, DeviceConfig, EncryptionKey, IntegrityConfig,
//!     OnDiskBlockStore};
//!
//! # fn main() -> Result<(), veilfs::Error> {
//! let store = OnDiskBlockStore::new("/mnt/backup/blocks".into());
//! let key = EncryptionKey::from_hex("0ab1…")?;
//! let device: Device<Aes256Gcm, _> = Device::new(
//!     store,
//!     key,
//!     "/var/lib/veilfs/state".as_ref(),
//!     DeviceConfig {
//!         physical_block_size_bytes: 32 * 1024,
//!         root_blob_id: None,
//!         integrity: IntegrityConfig::default(),
//!     },
//! )?;
//! let root = device.load_root_blob()?;
//! # Ok(()) }
//! ```

mod device;
mod error;
mod layers;
mod localstate;
mod os;
mod prelude;
mod util;

pub use self::{
    device::{Device, DeviceConfig},
    error::{Errno, Error},
    layers::bio::{BlockId, BlockStore, InMemoryBlockStore, OnDiskBlockStore},
    layers::blob::{Blob, BlobStoreOnBlocks},
    layers::crypto::{
        Aes256Gcm, Cipher, EncryptedBlockStore, EncryptionKey, XChaCha20Poly1305,
    },
    layers::fsblob::{
        DirBlob, DirEntry, EntryType, FileBlob, FsBlob, FsBlobRef, FsBlobStore, LstatSizeGetter,
        NodeAttrs, ParallelAccessFsBlobStore, SymlinkBlob, Timespec,
    },
    layers::integrity::{IntegrityBlockStore, IntegrityConfig, KnownBlockVersions},
    localstate::LocalStateMetadata,
};
