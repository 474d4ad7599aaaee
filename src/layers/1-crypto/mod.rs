// SPDX-License-Identifier: MPL-2.0

//! The layer of cryptographical constructs.
//!
//! Adds authenticated encryption on top of the raw block layer. The
//! cipher is chosen at configuration time; the block store is generic
//! over anything implementing [`Cipher`].

mod cipher;
mod encrypted_block_store;
mod key;

pub use self::{
    cipher::{Aes256Gcm, Cipher, XChaCha20Poly1305},
    encrypted_block_store::EncryptedBlockStore,
    key::EncryptionKey,
};
