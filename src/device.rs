// SPDX-License-Identifier: MPL-2.0

//! Assembles the full store stack into a mountable device.
//!
//! The configuration layer above (file format, password handling, key
//! derivation) is not this crate's concern; the device consumes the
//! already-parsed essentials: a cipher choice, the encryption key, the
//! physical block size, and the root blob id (if the filesystem exists
//! already).

use std::path::Path;

use crate::layers::bio::{BlockId, BlockStore};
use crate::layers::blob::BlobStoreOnBlocks;
use crate::layers::crypto::{Cipher, EncryptedBlockStore, EncryptionKey};
use crate::layers::fsblob::{FsBlobRef, FsBlobStore, ParallelAccessFsBlobStore};
use crate::layers::integrity::{IntegrityBlockStore, IntegrityConfig, KnownBlockVersions};
use crate::localstate::LocalStateMetadata;
use crate::prelude::*;

/// Device-level configuration, typically read from a config file by the
/// caller.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Size of one block on the lowest storage layer.
    pub physical_block_size_bytes: u32,
    /// Root directory blob, or `None` to create a fresh filesystem. The
    /// generated id is available via [`Device::root_blob_id`] and must
    /// be persisted by the caller.
    pub root_blob_id: Option<BlockId>,
    pub integrity: IntegrityConfig,
}

type StoreStack<C, B> = IntegrityBlockStore<EncryptedBlockStore<C, B>>;

/// The assembled filesystem core: block store stack, blob tree, typed
/// blobs, and the parallel-access coordinator on top.
///
/// Data flows `ParallelAccessFsBlobStore → FsBlobStore →
/// BlobStoreOnBlocks → IntegrityBlockStore → EncryptedBlockStore →
/// raw store` on the way down.
pub struct Device<C: Cipher, B: BlockStore + 'static> {
    fs_blob_store: Arc<ParallelAccessFsBlobStore<StoreStack<C, B>>>,
    root_blob_id: BlockId,
    my_client_id: u32,
}

impl<C: Cipher, B: BlockStore + 'static> Device<C, B> {
    /// Opens (or, with `config.root_blob_id == None`, creates) a
    /// filesystem on `base_store`.
    ///
    /// `state_dir` holds this client's local state: its client id, the
    /// key fingerprint, and the block version table. Presenting a key
    /// that does not match the recorded fingerprint fails with
    /// `BadConfig`.
    pub fn new(
        base_store: B,
        encryption_key: EncryptionKey,
        state_dir: &Path,
        config: DeviceConfig,
    ) -> Result<Self> {
        let local_state = LocalStateMetadata::load_or_generate(state_dir, &encryption_key)?;
        let known_versions = KnownBlockVersions::new(
            LocalStateMetadata::integrity_file_path(state_dir),
            local_state.my_client_id(),
        )?;
        let cipher = C::with_key(encryption_key)?;

        let encrypted_store = EncryptedBlockStore::new(cipher, base_store);
        let integrity_store =
            IntegrityBlockStore::new(encrypted_store, known_versions, config.integrity);
        let blob_store =
            BlobStoreOnBlocks::new(integrity_store, config.physical_block_size_bytes)?;
        let fs_blob_store = ParallelAccessFsBlobStore::new(FsBlobStore::new(blob_store));

        // Directory stat calls need child sizes; resolve them through
        // the coordinator so an already-open child is consulted instead
        // of racing a second load.
        let weak_store = Arc::downgrade(&fs_blob_store);
        fs_blob_store.set_lstat_size_getter(Arc::new(move |id| {
            let Some(store) = weak_store.upgrade() else {
                return_errno_with_msg!(UsageError, "filesystem is shutting down");
            };
            let Some(blob) = store.load(id)? else {
                return_errno_with_msg!(NotFound, "child blob does not exist");
            };
            let size = blob.lstat_size();
            blob.release()?;
            size
        }));

        let root_blob_id = match config.root_blob_id {
            Some(id) => {
                let Some(root) = fs_blob_store.load(&id)? else {
                    return_errno_with_msg!(BadConfig, "root blob does not exist");
                };
                root.as_dir()?;
                root.release()?;
                id
            }
            None => {
                let root = fs_blob_store.create_dir_blob()?;
                let id = *root.blob_id();
                root.release()?;
                id
            }
        };

        Ok(Self {
            fs_blob_store,
            root_blob_id,
            my_client_id: local_state.my_client_id(),
        })
    }

    /// The root directory blob's id. Persist this when creating a fresh
    /// filesystem.
    pub fn root_blob_id(&self) -> &BlockId {
        &self.root_blob_id
    }

    pub fn my_client_id(&self) -> u32 {
        self.my_client_id
    }

    pub fn load_root_blob(&self) -> Result<FsBlobRef<StoreStack<C, B>>> {
        match self.fs_blob_store.load(&self.root_blob_id)? {
            Some(root) => Ok(root),
            None => return_errno_with_msg!(CorruptedStorage, "root blob disappeared"),
        }
    }

    pub fn load_blob(&self, id: &BlockId) -> Result<Option<FsBlobRef<StoreStack<C, B>>>> {
        self.fs_blob_store.load(id)
    }

    pub fn create_file_blob(&self) -> Result<FsBlobRef<StoreStack<C, B>>> {
        self.fs_blob_store.create_file_blob()
    }

    pub fn create_dir_blob(&self) -> Result<FsBlobRef<StoreStack<C, B>>> {
        self.fs_blob_store.create_dir_blob()
    }

    pub fn create_symlink_blob(&self, target: &str) -> Result<FsBlobRef<StoreStack<C, B>>> {
        self.fs_blob_store.create_symlink_blob(target)
    }

    /// Removes the blob behind the sole handle `blob`.
    pub fn remove_blob(&self, blob: FsBlobRef<StoreStack<C, B>>) -> Result<()> {
        self.fs_blob_store.remove(blob)
    }

    pub fn remove_blob_by_id(&self, id: &BlockId) -> Result<()> {
        self.fs_blob_store.remove_by_id(id)
    }

    pub fn num_blocks(&self) -> Result<u64> {
        self.fs_blob_store.num_blocks()
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> Result<u64> {
        self.fs_blob_store.estimate_space_for_num_blocks_left()
    }

    pub fn virtual_block_size_bytes(&self) -> u32 {
        self.fs_blob_store.virtual_block_size_bytes()
    }
}
