//! The `meta` header file: MIME-style `Key: value` lines under canonical key
//! casing, keys emitted in ascending order, terminated by a blank line.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

/// Opaque KDF parameters injected by the key function on create.
pub const META_CRYPT_SETTINGS: &str = "Crypt-Settings";

/// Hex-encoded initial nonce of the legacy base format. The block-framed base
/// stores its nonce inline, so this key is only ever read, never written.
pub const META_NONCE: &str = "Nonce";

pub type MetaResult<T> = Result<T, MetaError>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed meta line {line:?}")]
    MalformedLine { line: String },
}

/// Ordered mapping from canonical header keys to value sequences.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    fields: BTreeMap<String, Vec<String>>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(&canonical_key(key))
    }

    /// Replaces all values under `key` with a single value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(canonical_key(key), vec![value.into()]);
    }

    /// Appends a value under `key`, keeping existing ones.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.fields
            .entry(canonical_key(key))
            .or_default()
            .push(value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.fields.remove(&canonical_key(key))
    }

    /// First value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(&canonical_key(key))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn values(&self, key: &str) -> &[String] {
        self.fields
            .get(&canonical_key(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn set_bytes(&mut self, key: &str, value: &[u8]) {
        self.set(key, hex::encode(value));
    }

    /// Hex-decodes the first value under `key`. Missing keys and bad hex both
    /// come back as `None`.
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key).and_then(|value| hex::decode(value).ok())
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.set(key, value.to_string());
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|value| value.parse().ok())
    }

    /// Parses `Key: value` lines up to a blank line or EOF. Keys are folded
    /// to canonical casing on the way in.
    pub fn read_from(r: impl Read) -> MetaResult<Self> {
        let mut meta = Meta::new();
        let mut reader = BufReader::new(r);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                break;
            }
            let (key, value) = trimmed.split_once(':').ok_or_else(|| {
                MetaError::MalformedLine {
                    line: trimmed.to_string(),
                }
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(MetaError::MalformedLine {
                    line: trimmed.to_string(),
                });
            }
            meta.add(key, value.trim());
        }
        Ok(meta)
    }

    /// Writes `Key: value` lines in ascending key order, followed by a blank
    /// line. Returns the number of bytes written.
    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<u64> {
        let mut total = 0u64;
        for (key, values) in &self.fields {
            for value in values {
                let line = format!("{key}: {value}\n");
                w.write_all(line.as_bytes())?;
                total += line.len() as u64;
            }
        }
        w.write_all(b"\n")?;
        Ok(total + 1)
    }
}

pub fn read_meta_file(path: impl AsRef<Path>) -> MetaResult<Meta> {
    let file = File::open(path)?;
    Meta::read_from(file)
}

/// Canonical MIME header casing: the first letter and every letter after a
/// hyphen upper-cased, everything else lower-cased.
fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = true;
    for ch in key.chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        upper = ch == '-';
    }
    out
}
