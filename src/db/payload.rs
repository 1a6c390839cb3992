//! Opaque binary side-files attached to changes by id.

use std::fs::File;
use std::io::{self, Read};

use crate::crypto::BlockReader;

/// A payload to be stored alongside a change: a caller-supplied id and the
/// bytes to write. Ids are opaque labels; the file lands at `payload-<id>`.
pub struct Payload<'a> {
    pub(crate) id: String,
    pub(crate) source: Box<dyn Read + 'a>,
}

impl<'a> Payload<'a> {
    pub fn new(id: impl Into<String>, source: impl Read + 'a) -> Self {
        Self {
            id: id.into(),
            source: Box::new(source),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug)]
enum PayloadSource {
    Plain(File),
    Decrypting(BlockReader<File>),
}

/// Streaming reader over a stored payload, decrypting transparently when the
/// database carries a key.
#[derive(Debug)]
pub struct PayloadReader {
    source: PayloadSource,
}

impl PayloadReader {
    pub(crate) fn plain(file: File) -> Self {
        Self {
            source: PayloadSource::Plain(file),
        }
    }

    pub(crate) fn decrypting(reader: BlockReader<File>) -> Self {
        Self {
            source: PayloadSource::Decrypting(reader),
        }
    }
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            PayloadSource::Plain(file) => file.read(buf),
            PayloadSource::Decrypting(reader) => reader.read(buf),
        }
    }
}
