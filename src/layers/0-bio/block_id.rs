// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use crate::os;
use crate::prelude::*;

/// The identifier of a block: 16 uniformly random bytes.
///
/// Serialized as 32 uppercase hex characters where a textual form is
/// needed (on-disk filenames, log messages). Equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId([u8; Self::BINARY_LEN]);

impl BlockId {
    pub const BINARY_LEN: usize = 16;
    pub const STRING_LEN: usize = 2 * Self::BINARY_LEN;

    /// Draws a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::BINARY_LEN];
        os::fill_random(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; Self::BINARY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != Self::BINARY_LEN {
            return_errno_with_msg!(InvalidArgs, "wrong length for a block id");
        }
        let mut bytes = [0u8; Self::BINARY_LEN];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::BINARY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(Self::STRING_LEN);
        for byte in self.0 {
            use std::fmt::Write;
            write!(hex, "{:02X}", byte).expect("writing to a String cannot fail");
        }
        hex
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != Self::STRING_LEN || !hex.is_ascii() {
            return_errno_with_msg!(InvalidArgs, "wrong length for a hex block id");
        }
        let mut bytes = [0u8; Self::BINARY_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::with_msg(InvalidArgs, "invalid hex digit in block id"))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::BlockId;

    #[test]
    fn hex_roundtrip() {
        let id = BlockId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), BlockId::STRING_LEN);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(BlockId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(BlockId::from_hex("too short").is_err());
        assert!(BlockId::from_hex(&"Z".repeat(BlockId::STRING_LEN)).is_err());
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(BlockId::random(), BlockId::random());
    }
}
