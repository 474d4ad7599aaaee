// SPDX-License-Identifier: MPL-2.0

//! Per-filesystem local state: this client's writer id and a fingerprint
//! of the encryption key.
//!
//! The state directory also hosts the integrity state file (see the
//! integrity layer); this module owns the metadata file next to it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::layers::crypto::EncryptionKey;
use crate::os;
use crate::prelude::*;

const METADATA_FILE_NAME: &str = "metadata";
const INTEGRITY_FILE_NAME: &str = "integrity.state";

/// Persistent metadata of one client for one filesystem.
///
/// Generated on first use: a random client id, plus a hash of the
/// encryption key. On every later open the stored fingerprint must match
/// the presented key; a mismatch means the wrong key, or local state
/// belonging to a different filesystem.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LocalStateMetadata {
    my_client_id: u32,
    encryption_key_fingerprint: [u8; 32],
}

impl LocalStateMetadata {
    /// Loads the metadata from `state_dir`, generating and persisting it
    /// if this is the first open.
    pub fn load_or_generate(state_dir: &Path, encryption_key: &EncryptionKey) -> Result<Self> {
        let path = Self::metadata_path(state_dir);
        let fingerprint = fingerprint_of(encryption_key);
        match fs::read(&path) {
            Ok(bytes) => {
                let loaded: Self = postcard::from_bytes(&bytes).map_err(|err| {
                    Error::with_msg(BadConfig, "cannot parse the local state metadata")
                        .with_cause(err)
                })?;
                if loaded.encryption_key_fingerprint != fingerprint {
                    return_errno_with_msg!(
                        BadConfig,
                        "encryption key fingerprint mismatch: wrong key or a different filesystem"
                    );
                }
                Ok(loaded)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let generated = Self {
                    my_client_id: os::random_u32(),
                    encryption_key_fingerprint: fingerprint,
                };
                generated.save(state_dir, &path)?;
                Ok(generated)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn my_client_id(&self) -> u32 {
        self.my_client_id
    }

    /// Path of the integrity state file inside the same directory.
    pub fn integrity_file_path(state_dir: &Path) -> PathBuf {
        state_dir.join(INTEGRITY_FILE_NAME)
    }

    fn metadata_path(state_dir: &Path) -> PathBuf {
        state_dir.join(METADATA_FILE_NAME)
    }

    fn save(&self, state_dir: &Path, path: &Path) -> Result<()> {
        fs::create_dir_all(state_dir)?;
        let serialized = postcard::to_allocvec(self)
            .map_err(|err| Error::with_msg(IoFailed, "cannot serialize metadata").with_cause(err))?;
        let tmp_path = path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn fingerprint_of(key: &EncryptionKey) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}
