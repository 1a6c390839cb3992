//! Per-entry AEAD envelope for the log. Every entry carries its own nonce and
//! tag, so entries stay independently decryptable; there is no chaining.

use crate::log::{LogEntry, LogEntryKind, LogError, LogRead, LogResult, LogWrite};

use super::cipher::{Cipher, CryptoError, NONCE_LEN};
use super::nonce::NonceSource;

pub struct EncryptedLogWriter<W> {
    inner: W,
    cipher: Cipher,
    nonce: NonceSource,
}

impl<W: LogWrite> EncryptedLogWriter<W> {
    pub fn new(inner: W, key: &[u8], nonce: NonceSource) -> Result<Self, CryptoError> {
        Ok(Self {
            inner,
            cipher: Cipher::new(key)?,
            nonce,
        })
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: LogWrite> LogWrite for EncryptedLogWriter<W> {
    // The passed kind is deliberately ignored: everything leaving this writer
    // is an AES-GCM entry wrapping the caller's body.
    fn write_entry(&mut self, _kind: LogEntryKind, body: &[u8]) -> LogResult<u64> {
        let nonce = self.nonce.next(NONCE_LEN);
        let ciphertext = self.cipher.seal(&nonce, body)?;

        let mut framed = nonce;
        framed.extend_from_slice(&ciphertext);

        self.inner
            .write_entry(LogEntryKind::AesGcmEncrypted, &framed)
    }
}

pub struct EncryptedLogReader<R> {
    inner: R,
    cipher: Cipher,
}

impl<R: LogRead> EncryptedLogReader<R> {
    pub fn new(inner: R, key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            inner,
            cipher: Cipher::new(key)?,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: LogRead> LogRead for EncryptedLogReader<R> {
    fn read_entry(&mut self) -> LogResult<Option<LogEntry>> {
        let entry = match self.inner.read_entry()? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if entry.kind() != LogEntryKind::AesGcmEncrypted {
            return Ok(Some(entry));
        }

        let body = entry.body();
        if body.len() < NONCE_LEN {
            return Err(LogError::malformed("encrypted entry shorter than nonce"));
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        let plaintext = self.cipher.open(nonce, ciphertext)?;

        Ok(Some(LogEntry::new(
            LogEntryKind::Binary,
            plaintext.into(),
        )))
    }
}
