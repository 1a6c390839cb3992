//! Block-chained AEAD used for the base and for payload files.
//!
//! The file starts with a single 12-byte nonce, followed by ciphertext blocks
//! framed as `u16-le length | ciphertext`. Plaintext blocks are 4096 bytes
//! (the final block may be shorter). The nonce for block k+1 is the last 12
//! bytes of SHA-256 over the nonce for block k, a deterministic,
//! key-independent chain that readers and writers compute identically.

use std::io::{self, Read, Write};
use std::mem;

use sha2::{Digest, Sha256};

use super::cipher::{Cipher, CryptoError, NONCE_LEN};
use super::nonce::NonceSource;

/// Plaintext block size in bytes.
pub const BLOCK_LEN: usize = 4096;

fn advance_nonce(nonce: &mut Vec<u8>) {
    let digest = Sha256::digest(nonce.as_slice());
    *nonce = digest[digest.len() - NONCE_LEN..].to_vec();
}

fn crypto_io_error(err: CryptoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

pub struct BlockWriter<W> {
    inner: W,
    cipher: Cipher,
    nonce: Vec<u8>,
    nonce_written: bool,
    buffer: Vec<u8>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(inner: W, key: &[u8], nonce: NonceSource) -> Result<Self, CryptoError> {
        Ok(Self {
            inner,
            cipher: Cipher::new(key)?,
            nonce: nonce.next(NONCE_LEN),
            nonce_written: false,
            buffer: Vec::new(),
        })
    }

    /// Seals the trailing partial block and returns the inner writer. A
    /// writer that never received data still emits its nonce, so an empty
    /// payload reads back as empty instead of failing.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_nonce_once()?;
        if !self.buffer.is_empty() {
            let block = mem::take(&mut self.buffer);
            self.emit_block(&block)?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_nonce_once(&mut self) -> io::Result<()> {
        if !self.nonce_written {
            self.inner.write_all(&self.nonce)?;
            self.nonce_written = true;
        }
        Ok(())
    }

    fn emit_block(&mut self, plaintext: &[u8]) -> io::Result<()> {
        let ciphertext = self
            .cipher
            .seal(&self.nonce, plaintext)
            .map_err(crypto_io_error)?;
        self.inner
            .write_all(&(ciphertext.len() as u16).to_le_bytes())?;
        self.inner.write_all(&ciphertext)?;
        advance_nonce(&mut self.nonce);
        Ok(())
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write_nonce_once()?;
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= BLOCK_LEN {
            let rest = self.buffer.split_off(BLOCK_LEN);
            let block = mem::replace(&mut self.buffer, rest);
            self.emit_block(&block)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug)]
pub struct BlockReader<R> {
    inner: R,
    cipher: Cipher,
    nonce: Vec<u8>,
    nonce_read: bool,
    buffer: Vec<u8>,
    pos: usize,
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R, key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            inner,
            cipher: Cipher::new(key)?,
            nonce: Vec::new(),
            nonce_read: false,
            buffer: Vec::new(),
            pos: 0,
        })
    }

    /// Fills `buf` completely. `Ok(false)` means EOF fell exactly on the
    /// first byte; a partial fill is an `UnexpectedEof` error.
    fn read_full_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated cipher block stream",
                ));
            }
            filled += n;
        }
        Ok(true)
    }

    /// Decrypts the next block into the internal buffer. `Ok(false)` on a
    /// clean end of stream.
    fn refill(&mut self) -> io::Result<bool> {
        if !self.nonce_read {
            let mut nonce = [0u8; NONCE_LEN];
            if !self.read_full_or_eof(&mut nonce)? {
                return Ok(false);
            }
            self.nonce = nonce.to_vec();
            self.nonce_read = true;
        }

        let mut len_buf = [0u8; 2];
        if !self.read_full_or_eof(&mut len_buf)? {
            return Ok(false);
        }
        let len = u16::from_le_bytes(len_buf) as usize;

        let mut ciphertext = vec![0u8; len];
        if !self.read_full_or_eof(&mut ciphertext)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated cipher block",
            ));
        }

        let plaintext = self
            .cipher
            .open(&self.nonce, &ciphertext)
            .map_err(crypto_io_error)?;
        advance_nonce(&mut self.nonce);

        self.buffer = plaintext;
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.buffer.len() {
                let n = (self.buffer.len() - self.pos).min(out.len());
                out[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if !self.refill()? {
                return Ok(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];

    fn zero_nonce() -> NonceSource {
        NonceSource::fixed(vec![0u8; 12])
    }

    #[test]
    fn one_small_block() {
        let mut writer = BlockWriter::new(Vec::new(), &TEST_KEY, zero_nonce()).unwrap();
        writer.write_all(b"test").unwrap();
        let out = writer.finish().unwrap();

        assert_eq!(
            hex::encode(&out),
            "00000000000000000000000014003db3f4279656006e7709353435b75d10b6d9295a"
        );
    }

    #[test]
    fn small_block_reads_back() {
        let raw =
            hex::decode("00000000000000000000000014003db3f4279656006e7709353435b75d10b6d9295a")
                .unwrap();
        let mut reader = BlockReader::new(raw.as_slice(), &TEST_KEY).unwrap();
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).unwrap();
        assert_eq!(plaintext, b"test");
    }

    #[test]
    fn multi_block_roundtrip() {
        let plaintext: Vec<u8> = (0..BLOCK_LEN * 2 + 100).map(|i| (i % 251) as u8).collect();

        let mut writer = BlockWriter::new(Vec::new(), &TEST_KEY, NonceSource::default()).unwrap();
        writer.write_all(&plaintext).unwrap();
        let sealed = writer.finish().unwrap();

        // nonce + three framed blocks, each 16 bytes of tag overhead
        assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + 3 * (2 + 16));

        let mut reader = BlockReader::new(sealed.as_slice(), &TEST_KEY).unwrap();
        let mut decrypted = Vec::new();
        reader.read_to_end(&mut decrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn megabyte_roundtrip() {
        let plaintext: Vec<u8> = (0..1 << 20).map(|i| (i * 31 % 257) as u8).collect();

        let mut writer = BlockWriter::new(Vec::new(), &[9u8; 32], NonceSource::default()).unwrap();
        writer.write_all(&plaintext).unwrap();
        let sealed = writer.finish().unwrap();

        let mut reader = BlockReader::new(sealed.as_slice(), &[9u8; 32]).unwrap();
        let mut decrypted = Vec::new();
        reader.read_to_end(&mut decrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn exact_block_boundary_roundtrip() {
        let plaintext = vec![0x42u8; BLOCK_LEN];

        let mut writer = BlockWriter::new(Vec::new(), &TEST_KEY, zero_nonce()).unwrap();
        writer.write_all(&plaintext).unwrap();
        let sealed = writer.finish().unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 2 + BLOCK_LEN + 16);

        let mut reader = BlockReader::new(sealed.as_slice(), &TEST_KEY).unwrap();
        let mut decrypted = Vec::new();
        reader.read_to_end(&mut decrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn empty_input_emits_only_the_nonce() {
        let writer = BlockWriter::new(Vec::new(), &TEST_KEY, zero_nonce()).unwrap();
        let out = writer.finish().unwrap();
        assert_eq!(out, vec![0u8; NONCE_LEN]);

        let mut reader = BlockReader::new(out.as_slice(), &TEST_KEY).unwrap();
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).unwrap();
        assert!(plaintext.is_empty());
    }

    #[test]
    fn empty_file_reads_as_empty() {
        let mut reader = BlockReader::new([].as_slice(), &TEST_KEY).unwrap();
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).unwrap();
        assert!(plaintext.is_empty());
    }

    #[test]
    fn wrong_key_surfaces_invalid_key() {
        let mut writer = BlockWriter::new(Vec::new(), &TEST_KEY, NonceSource::default()).unwrap();
        writer.write_all(b"secret").unwrap();
        let sealed = writer.finish().unwrap();

        let mut wrong = TEST_KEY;
        wrong[15] ^= 0x01;
        let mut reader = BlockReader::new(sealed.as_slice(), &wrong).unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(crate::crypto::chain_contains_invalid_key(&err));
    }

    #[test]
    fn nonce_chain_is_iterated_sha256_tail() {
        let mut nonce = vec![0xabu8; NONCE_LEN];
        let mut expected = nonce.clone();
        for _ in 0..5 {
            advance_nonce(&mut nonce);
            let digest = Sha256::digest(&expected);
            expected = digest[digest.len() - NONCE_LEN..].to_vec();
            assert_eq!(nonce, expected);
        }
    }

    #[test]
    fn truncated_block_is_an_error() {
        let mut writer = BlockWriter::new(Vec::new(), &TEST_KEY, zero_nonce()).unwrap();
        writer.write_all(b"test content").unwrap();
        let mut sealed = writer.finish().unwrap();
        sealed.truncate(sealed.len() - 3);

        let mut reader = BlockReader::new(sealed.as_slice(), &TEST_KEY).unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
