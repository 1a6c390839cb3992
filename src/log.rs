//! Framed log codec: typed, length-prefixed records over any byte stream.
//!
//! Each record is a four-byte big-endian header followed by the body. The top
//! four bits of the header carry the type tag, the remaining 28 bits the body
//! size, so a single entry body is capped at 268,435,455 bytes.

use std::io::{self, Read, Write};

use bytes::Bytes;
use thiserror::Error;

use crate::crypto::CryptoError;

/// Maximum body size of a single log entry (28 bits).
pub const MAX_ENTRY_LEN: usize = 0x0fff_ffff;

const KIND_MASK: u32 = 0xf000_0000;

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed log: {reason}")]
    Malformed { reason: String },
    #[error("log entry body exceeds {MAX_ENTRY_LEN} bytes (got {got})")]
    EntryTooLarge { got: usize },
    #[error("{0}")]
    Crypto(#[from] CryptoError),
    #[error("log entry {index}: {source}")]
    AtEntry {
        index: u64,
        #[source]
        source: Box<LogError>,
    },
}

impl LogError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        LogError::Malformed {
            reason: reason.into(),
        }
    }

    pub(crate) fn at_entry(index: u64, source: LogError) -> Self {
        LogError::AtEntry {
            index,
            source: Box::new(source),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEntryKind {
    Binary,
    AesGcmEncrypted,
}

impl LogEntryKind {
    fn from_tag(tag: u32) -> LogResult<Self> {
        match tag {
            0x0 => Ok(LogEntryKind::Binary),
            0x1 => Ok(LogEntryKind::AesGcmEncrypted),
            other => Err(LogError::malformed(format!(
                "unknown entry type tag {other:#x}"
            ))),
        }
    }

    fn tag(self) -> u32 {
        match self {
            LogEntryKind::Binary => 0x0,
            LogEntryKind::AesGcmEncrypted => 0x1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    kind: LogEntryKind,
    body: Bytes,
}

impl LogEntry {
    pub fn new(kind: LogEntryKind, body: Bytes) -> Self {
        Self { kind, body }
    }

    pub fn kind(&self) -> LogEntryKind {
        self.kind
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// Source of log entries. Implemented by [`LogReader`] and by the decrypting
/// wrapper in [`crate::crypto`].
pub trait LogRead {
    /// Returns the next entry, or `None` on a clean end of log.
    fn read_entry(&mut self) -> LogResult<Option<LogEntry>>;
}

/// Sink for log entries. Implemented by [`LogWriter`] and by the encrypting
/// wrapper in [`crate::crypto`].
pub trait LogWrite {
    /// Writes one entry and returns the number of bytes written. The entry is
    /// fully flushed to the underlying stream before this returns.
    fn write_entry(&mut self, kind: LogEntryKind, body: &[u8]) -> LogResult<u64>;
}

pub struct LogReader<R> {
    inner: R,
}

impl<R: Read> LogReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_header(&mut self) -> LogResult<Option<u32>> {
        let mut header = [0u8; 4];
        let mut filled = 0usize;
        while filled < header.len() {
            let n = self.inner.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(LogError::malformed("partial entry header at end of log"));
        }
        Ok(Some(u32::from_be_bytes(header)))
    }
}

impl<R: Read> LogRead for LogReader<R> {
    fn read_entry(&mut self) -> LogResult<Option<LogEntry>> {
        let word = match self.read_header()? {
            Some(word) => word,
            None => return Ok(None),
        };

        let kind = LogEntryKind::from_tag(word >> 28)?;
        let size = (word & !KIND_MASK) as usize;

        let mut body = vec![0u8; size];
        self.inner.read_exact(&mut body).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                LogError::malformed("truncated entry body")
            } else {
                LogError::Io(err)
            }
        })?;

        Ok(Some(LogEntry::new(kind, Bytes::from(body))))
    }
}

pub struct LogWriter<W> {
    inner: W,
}

impl<W: Write> LogWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> LogWrite for LogWriter<W> {
    fn write_entry(&mut self, kind: LogEntryKind, body: &[u8]) -> LogResult<u64> {
        if body.len() > MAX_ENTRY_LEN {
            return Err(LogError::EntryTooLarge { got: body.len() });
        }

        let word = (kind.tag() << 28) | body.len() as u32;
        self.inner.write_all(&word.to_be_bytes())?;
        self.inner.write_all(body)?;
        self.inner.flush()?;

        Ok(4 + body.len() as u64)
    }
}

/// In-memory log implementing both halves of the codec. Entries written to
/// the buffer can be read back from it; reads start at the front and never
/// consume what writes appended.
#[derive(Clone, Debug, Default)]
pub struct LogBuffer {
    data: Vec<u8>,
    read_index: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            read_index: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn hex_string(&self) -> String {
        hex::encode(&self.data)
    }
}

impl LogWrite for LogBuffer {
    fn write_entry(&mut self, kind: LogEntryKind, body: &[u8]) -> LogResult<u64> {
        LogWriter::new(&mut self.data).write_entry(kind, body)
    }
}

impl LogRead for LogBuffer {
    fn read_entry(&mut self) -> LogResult<Option<LogEntry>> {
        let mut reader = LogReader::new(&self.data[self.read_index..]);
        let entry = reader.read_entry()?;
        let remaining = reader.into_inner().len();
        self.read_index = self.data.len() - remaining;
        Ok(entry)
    }
}

/// Counts the entries remaining in `reader`.
pub fn read_log_len<R: LogRead + ?Sized>(reader: &mut R) -> LogResult<u64> {
    read_log_entries(reader, |_, _| Ok(()))
}

/// Iterates all remaining entries. A read or visitor error aborts iteration,
/// wrapped with the index of the offending entry. Returns the entry count.
pub fn read_log_entries<R: LogRead + ?Sized>(
    reader: &mut R,
    mut visit: impl FnMut(u64, LogEntry) -> LogResult<()>,
) -> LogResult<u64> {
    let mut index = 0u64;
    loop {
        let entry = match reader.read_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(index),
            Err(err) => return Err(LogError::at_entry(index, err)),
        };
        visit(index, entry).map_err(|err| LogError::at_entry(index, err))?;
        index += 1;
    }
}
