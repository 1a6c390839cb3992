//! Capability traits for the application-defined model.
//!
//! The core never inspects base, state or change content. It only needs the
//! operations below: serialize, deserialize, apply, and (optionally) advertise
//! payload ids. Applications typically implement `Change` as a tagged union
//! with one case per type name and a match-based factory.

use std::io::{Read, Write};

use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown change type {type_name:?}")]
    UnknownType { type_name: String },
    #[error("encode: {0}")]
    Encode(#[source] BoxedError),
    #[error("decode: {0}")]
    Decode(#[source] BoxedError),
    #[error("apply: {0}")]
    Apply(#[source] BoxedError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// A replayable event. Changes are value objects; identity comes from log
/// position.
pub trait Change {
    /// Stable name of the change type. Must be at most 255 bytes.
    fn type_name(&self) -> &str;

    fn read_from(&mut self, r: &mut dyn Read) -> ModelResult<u64>;

    fn write_to(&self, w: &mut dyn Write) -> ModelResult<u64>;

    /// Ids of payload files this change references.
    fn payload_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The frozen starting point of the state at the front of the log. Its
/// serialization format is opaque to the core.
pub trait Base {
    type Change: Change;

    fn read_from(&mut self, r: &mut dyn Read) -> ModelResult<u64>;

    fn write_to(&self, w: &mut dyn Write) -> ModelResult<u64>;

    /// Folds a change into the base. Only called while splicing a rebase
    /// prefix.
    fn apply(&mut self, change: &Self::Change) -> ModelResult<()>;

    /// Ids of payload files the base references.
    fn payload_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The live in-memory view derived from base + log.
pub trait State {
    type Change: Change;

    fn apply(&mut self, change: &Self::Change) -> ModelResult<()>;
}

pub trait Factory {
    type Base: Base<Change = Self::Change>;
    type State: State<Change = Self::Change>;
    type Change: Change;

    fn new_base(&self) -> Self::Base;

    fn new_state(&self, base: &Self::Base) -> Self::State;

    /// Returns an empty change of the named type, ready to be deserialized.
    /// Unknown names fail with [`ModelError::UnknownType`].
    fn new_change(&self, type_name: &str) -> ModelResult<Self::Change>;
}
