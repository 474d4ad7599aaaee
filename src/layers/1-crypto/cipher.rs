// SPDX-License-Identifier: MPL-2.0

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead as _, KeyInit as _};

use super::EncryptionKey;
use crate::os;
use crate::prelude::*;

/// An authenticated cipher, chosen at configuration time.
///
/// # On-disk format
///
/// Every encrypted block is laid out as
///
/// ```text
/// ┌─────────┬──────────────────────────────┬─────────┐
/// │  Nonce  │          Ciphertext          │   Tag   │
/// └─────────┴──────────────────────────────┴─────────┘
/// ```
///
/// with a fresh random nonce per encryption. [`CIPHERTEXT_OVERHEAD`] is
/// the fixed number of bytes added to each plaintext (nonce + tag).
///
/// [`CIPHERTEXT_OVERHEAD`]: Cipher::CIPHERTEXT_OVERHEAD
pub trait Cipher: Send + Sync + Sized + 'static {
    /// Cipher name, as it appears in configuration files.
    const NAME: &'static str;
    /// Required key length in bytes.
    const KEY_SIZE: usize;
    /// Fixed number of bytes encryption adds to a plaintext.
    const CIPHERTEXT_OVERHEAD: usize;

    /// Initializes the cipher with the given key.
    ///
    /// Fails with `UsageError` if the key has the wrong length.
    fn with_key(key: EncryptionKey) -> Result<Self>;

    /// Encrypts `plaintext` under a fresh random nonce.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts and authenticates `ciphertext`.
    ///
    /// A failing authentication tag means the stored block was modified
    /// and is reported as `IntegrityViolation`.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

macro_rules! define_aead_cipher {
    ($(#[$attr:meta])* $name:ident, $impl_type:ty, $key_size:expr, $nonce_size:expr, $tag_size:expr, $config_name:expr) => {
        $(#[$attr])*
        pub struct $name {
            cipher: $impl_type,
            // Keeps the key allocation locked while the cipher lives.
            _key: EncryptionKey,
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }

        impl Cipher for $name {
            const NAME: &'static str = $config_name;
            const KEY_SIZE: usize = $key_size;
            const CIPHERTEXT_OVERHEAD: usize = $nonce_size + $tag_size;

            fn with_key(key: EncryptionKey) -> Result<Self> {
                if key.num_bytes() != Self::KEY_SIZE {
                    return_errno_with_msg!(UsageError, "wrong key size for this cipher");
                }
                let cipher = <$impl_type>::new(GenericArray::from_slice(key.as_bytes()));
                Ok(Self { cipher, _key: key })
            }

            fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
                let mut nonce = [0u8; $nonce_size];
                os::fill_random(&mut nonce);
                let ciphertext = self
                    .cipher
                    .encrypt(GenericArray::from_slice(&nonce), plaintext)
                    .map_err(|_| Error::with_msg(EncryptFailed, "block encryption failed"))?;
                let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }

            fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
                if ciphertext.len() < Self::CIPHERTEXT_OVERHEAD {
                    return_errno_with_msg!(CorruptedStorage, "encrypted block is too small");
                }
                let (nonce, rest) = ciphertext.split_at($nonce_size);
                self.cipher
                    .decrypt(GenericArray::from_slice(nonce), rest)
                    .map_err(|_| {
                        Error::with_msg(
                            IntegrityViolation,
                            "block authentication failed. Did an attacker modify the block?",
                        )
                    })
            }
        }
    };
}

define_aead_cipher!(
    /// AES-256 in GCM mode. The default cipher.
    Aes256Gcm,
    aes_gcm::Aes256Gcm,
    32,
    12,
    16,
    "aes-256-gcm"
);

define_aead_cipher!(
    /// XChaCha20-Poly1305 with its 24-byte nonce, for setups that prefer
    /// a cipher without AES hardware dependence.
    XChaCha20Poly1305,
    chacha20poly1305::XChaCha20Poly1305,
    32,
    24,
    16,
    "xchacha20-poly1305"
);

#[cfg(test)]
mod tests {
    use super::*;

    fn ciphers() -> (Aes256Gcm, XChaCha20Poly1305) {
        (
            Aes256Gcm::with_key(EncryptionKey::new_random(32)).unwrap(),
            XChaCha20Poly1305::with_key(EncryptionKey::new_random(32)).unwrap(),
        )
    }

    #[test]
    fn decrypt_after_encrypt_roundtrips() {
        let (aes, xchacha) = ciphers();
        let plaintext = b"some plaintext that is a bit longer than a block";
        assert_eq!(aes.decrypt(&aes.encrypt(plaintext).unwrap()).unwrap(), plaintext);
        assert_eq!(
            xchacha.decrypt(&xchacha.encrypt(plaintext).unwrap()).unwrap(),
            plaintext
        );
    }

    #[test]
    fn overhead_is_exact() {
        let (aes, xchacha) = ciphers();
        let plaintext = [7u8; 100];
        assert_eq!(
            aes.encrypt(&plaintext).unwrap().len(),
            plaintext.len() + Aes256Gcm::CIPHERTEXT_OVERHEAD
        );
        assert_eq!(
            xchacha.encrypt(&plaintext).unwrap().len(),
            plaintext.len() + XChaCha20Poly1305::CIPHERTEXT_OVERHEAD
        );
    }

    #[test]
    fn modified_ciphertext_is_rejected() {
        let (aes, _) = ciphers();
        let mut ciphertext = aes.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 1;
        let err = aes.decrypt(&ciphertext).unwrap_err();
        assert_eq!(err.errno(), IntegrityViolation);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let aes1 = Aes256Gcm::with_key(EncryptionKey::new_random(32)).unwrap();
        let aes2 = Aes256Gcm::with_key(EncryptionKey::new_random(32)).unwrap();
        let ciphertext = aes1.encrypt(b"payload").unwrap();
        assert_eq!(aes2.decrypt(&ciphertext).unwrap_err().errno(), IntegrityViolation);
    }

    #[test]
    fn wrong_key_size_is_usage_error() {
        let err = Aes256Gcm::with_key(EncryptionKey::new_random(16)).unwrap_err();
        assert_eq!(err.errno(), UsageError);
    }

    #[test]
    fn truncated_ciphertext_is_corrupted() {
        let (aes, _) = ciphers();
        let err = aes.decrypt(&[0u8; 10]).unwrap_err();
        assert_eq!(err.errno(), CorruptedStorage);
    }
}
