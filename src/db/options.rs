//! Option structs for create, open and splice.

use thiserror::Error;

use crate::crypto::NonceSource;
use crate::meta::Meta;
use crate::model::{ModelError, ModelResult};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("derive key: {reason}")]
pub struct KeyError {
    pub reason: String,
}

impl KeyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Maps the meta header to key bytes. An empty result means plaintext. The
/// meta is mutable so a real KDF can record its parameters (`Crypt-Settings`)
/// when a database is created.
pub type KeyFn = Box<dyn Fn(&mut Meta) -> Result<Vec<u8>, KeyError> + Send + Sync>;

/// A key function that ignores the meta and always returns `key`.
pub fn static_key(key: impl Into<Vec<u8>>) -> KeyFn {
    let key = key.into();
    Box::new(move |_| Ok(key.clone()))
}

pub(crate) fn derive_key(key_fn: Option<&KeyFn>, meta: &mut Meta) -> Result<Vec<u8>, KeyError> {
    match key_fn {
        Some(f) => f(meta),
        None => Ok(Vec::new()),
    }
}

pub struct CreateOptions {
    pub directory_mode: u32,
    pub file_mode: u32,
    pub meta: Meta,
    pub key_fn: Option<KeyFn>,
    pub nonce: NonceSource,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            directory_mode: 0o755,
            file_mode: 0o644,
            meta: Meta::new(),
            key_fn: None,
            nonce: NonceSource::Random,
        }
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory_mode(mut self, mode: u32) -> Self {
        self.directory_mode = mode;
        self
    }

    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn key(self, key: impl Into<Vec<u8>>) -> Self {
        self.key_fn(static_key(key))
    }

    pub fn key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    pub fn nonce(mut self, nonce: NonceSource) -> Self {
        self.nonce = nonce;
        self
    }
}

#[derive(Default)]
pub struct OpenOptions {
    pub key_fn: Option<KeyFn>,
    pub nonce: NonceSource,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(self, key: impl Into<Vec<u8>>) -> Self {
        self.key_fn(static_key(key))
    }

    pub fn key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }

    pub fn nonce(mut self, nonce: NonceSource) -> Self {
        self.nonce = nonce;
        self
    }
}

/// Decides which leading changes fold into the new base during a splice. The
/// selector is consulted in log order and never again after its first `false`.
pub enum Rebase<C> {
    /// Rewrite the log as-is (the default).
    None,
    /// Fold the first `n` changes.
    First(u64),
    /// Ask a caller-supplied selector per change.
    #[allow(clippy::type_complexity)]
    With(Box<dyn FnMut(&C, u64) -> ModelResult<bool> + Send>),
}

impl<C> Default for Rebase<C> {
    fn default() -> Self {
        Rebase::None
    }
}

impl<C> Rebase<C> {
    pub(crate) fn selects(&mut self, change: &C, index: u64) -> Result<bool, ModelError> {
        match self {
            Rebase::None => Ok(false),
            Rebase::First(n) => Ok(index < *n),
            Rebase::With(f) => f(change, index),
        }
    }
}

pub struct SpliceOptions<C> {
    pub source_key_fn: Option<KeyFn>,
    pub target_key_fn: Option<KeyFn>,
    pub rebase: Rebase<C>,
    pub nonce: NonceSource,
}

impl<C> Default for SpliceOptions<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SpliceOptions<C> {
    pub fn new() -> Self {
        Self {
            source_key_fn: None,
            target_key_fn: None,
            rebase: Rebase::None,
            nonce: NonceSource::Random,
        }
    }

    pub fn source_key(self, key: impl Into<Vec<u8>>) -> Self {
        self.source_key_fn(static_key(key))
    }

    pub fn source_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.source_key_fn = Some(key_fn);
        self
    }

    pub fn target_key(self, key: impl Into<Vec<u8>>) -> Self {
        self.target_key_fn(static_key(key))
    }

    pub fn target_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.target_key_fn = Some(key_fn);
        self
    }

    /// Folds the first `n` changes into the new base.
    pub fn rebase_first(mut self, n: u64) -> Self {
        self.rebase = Rebase::First(n);
        self
    }

    pub fn rebase_with(
        mut self,
        selector: impl FnMut(&C, u64) -> ModelResult<bool> + Send + 'static,
    ) -> Self {
        self.rebase = Rebase::With(Box::new(selector));
        self
    }

    pub fn nonce(mut self, nonce: NonceSource) -> Self {
        self.nonce = nonce;
        self
    }
}
