use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use thiserror::Error;

/// AES-GCM nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length {got} (expected 16 or 32 bytes)")]
    InvalidKeyLength { got: usize },
    #[error("invalid key")]
    InvalidKey,
    #[error("seal failed")]
    SealFailed,
}

/// AES-GCM with the variant picked by key length: 16 bytes runs AES-128,
/// 32 bytes AES-256.
pub(crate) enum Cipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cipher::Aes128(_) => f.write_str("Cipher::Aes128(..)"),
            Cipher::Aes256(_) => f.write_str("Cipher::Aes256(..)"),
        }
    }
}

impl Cipher {
    pub(crate) fn new(key: &[u8]) -> Result<Self, CryptoError> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map(Cipher::Aes128)
                .map_err(|_| CryptoError::InvalidKeyLength { got: key.len() }),
            32 => Aes256Gcm::new_from_slice(key)
                .map(Cipher::Aes256)
                .map_err(|_| CryptoError::InvalidKeyLength { got: key.len() }),
            got => Err(CryptoError::InvalidKeyLength { got }),
        }
    }

    pub(crate) fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Cipher::Aes128(c) => c.encrypt(Nonce::from_slice(nonce), plaintext),
            Cipher::Aes256(c) => c.encrypt(Nonce::from_slice(nonce), plaintext),
        }
        .map_err(|_| CryptoError::SealFailed)
    }

    /// Opens `ciphertext` (including the trailing tag). Any authentication
    /// failure comes back as [`CryptoError::InvalidKey`].
    pub(crate) fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Cipher::Aes128(c) => c.decrypt(Nonce::from_slice(nonce), ciphertext),
            Cipher::Aes256(c) => c.decrypt(Nonce::from_slice(nonce), ciphertext),
        }
        .map_err(|_| CryptoError::InvalidKey)
    }
}
