//! Streaming encryption: a per-entry AEAD envelope for the log and a
//! block-chained AEAD for base and payload files. Both run AES-GCM; the key
//! length selects AES-128 or AES-256.

mod block;
mod cipher;
mod log;
mod nonce;

pub use block::{BlockReader, BlockWriter, BLOCK_LEN};
pub use cipher::{CryptoError, NONCE_LEN};
pub use log::{EncryptedLogReader, EncryptedLogWriter};
pub use nonce::NonceSource;

pub(crate) use cipher::Cipher;

/// Walks an error chain looking for an AEAD authentication failure. Crypto
/// errors travel wrapped in `io::Error` wherever the wrappers implement
/// `Read`/`Write`, so a plain downcast is not enough.
pub(crate) fn chain_contains_invalid_key(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if matches!(e.downcast_ref::<CryptoError>(), Some(CryptoError::InvalidKey)) {
            return true;
        }
        current = e.source();
    }
    false
}
