// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use crate::os::LockedBytes;
use crate::prelude::*;

/// A symmetric encryption key, kept safe in memory.
///
/// The key bytes live in a single shared allocation that is locked into
/// RAM (best effort) and zeroed before being freed, no matter how often
/// the `EncryptionKey` handle is cloned. [`take`] and [`drop_prefix`]
/// return sibling keys over fresh locked allocations, which is cheap
/// because key sizes are at most a few dozen bytes.
///
/// Note: this is best effort. System hibernation can still write the key
/// to disk, and cipher implementations keep their own expanded key
/// schedule in regular memory.
///
/// [`take`]: EncryptionKey::take
/// [`drop_prefix`]: EncryptionKey::drop_prefix
#[derive(Clone)]
pub struct EncryptionKey {
    data: Arc<LockedBytes>,
}

impl EncryptionKey {
    /// Creates a key with the given number of random bytes.
    pub fn new_random(num_bytes: usize) -> Self {
        let mut data = LockedBytes::new_zeroed(num_bytes);
        crate::os::fill_random(data.as_mut_slice());
        Self {
            data: Arc::new(data),
        }
    }

    /// Copies the given bytes into a fresh locked allocation.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: Arc::new(LockedBytes::from_slice(bytes)),
        }
    }

    /// Parses a hex-encoded key, as stored in configuration files.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() % 2 != 0 || !hex.is_ascii() {
            return_errno_with_msg!(BadConfig, "encryption key is not valid hex");
        }
        let mut data = LockedBytes::new_zeroed(hex.len() / 2);
        for (i, byte) in data.as_mut_slice().iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::with_msg(BadConfig, "encryption key is not valid hex"))?;
        }
        Ok(Self {
            data: Arc::new(data),
        })
    }

    pub fn num_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Returns a key consisting of the first `num_taken` bytes.
    pub fn take(&self, num_taken: usize) -> Self {
        assert!(num_taken <= self.num_bytes(), "out of bounds");
        Self::from_bytes(&self.as_bytes()[..num_taken])
    }

    /// Returns a key with the first `num_dropped` bytes removed.
    pub fn drop_prefix(&self, num_dropped: usize) -> Self {
        assert!(num_dropped <= self.num_bytes(), "out of bounds");
        Self::from_bytes(&self.as_bytes()[num_dropped..])
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.debug_struct("EncryptionKey")
            .field("num_bytes", &self.num_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::EncryptionKey;

    #[test]
    fn from_hex_parses() {
        let key = EncryptionKey::from_hex("00FF10ab").unwrap();
        assert_eq!(key.as_bytes(), &[0x00, 0xFF, 0x10, 0xAB]);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(EncryptionKey::from_hex("0").is_err());
        assert!(EncryptionKey::from_hex("zz").is_err());
    }

    #[test]
    fn clones_share_the_allocation() {
        let key = EncryptionKey::new_random(32);
        let clone = key.clone();
        assert_eq!(key.as_bytes().as_ptr(), clone.as_bytes().as_ptr());
    }

    #[test]
    fn take_and_drop_prefix_split_the_key() {
        let key = EncryptionKey::from_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(key.take(2).as_bytes(), &[1, 2]);
        assert_eq!(key.drop_prefix(2).as_bytes(), &[3, 4, 5]);
        // Sub-keys get their own allocation.
        assert_ne!(key.take(2).as_bytes().as_ptr(), key.as_bytes().as_ptr());
    }
}
