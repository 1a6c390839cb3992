#![forbid(unsafe_code)]

pub mod crypto;
pub mod db;
pub mod deck;
pub mod engine;
pub mod error;
pub mod log;
pub mod memory;
pub mod meta;
pub mod model;
pub mod testing;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::crypto::{CryptoError, NonceSource};
pub use crate::db::{
    splice, static_key, CreateOptions, Database, DatabaseError, KeyError, KeyFn, OpenOptions,
    Payload, PayloadReader, Rebase, SpliceOptions, FILE_NAME_BASE, FILE_NAME_LOG, FILE_NAME_META,
    FILE_PREFIX_PAYLOAD,
};
pub use crate::deck::{Deck, DeckGuard};
pub use crate::engine::{Engine, EngineError};
pub use crate::log::{
    read_log_entries, read_log_len, LogBuffer, LogEntry, LogEntryKind, LogError, LogRead,
    LogReader, LogWrite, LogWriter,
};
pub use crate::meta::{read_meta_file, Meta, MetaError, META_CRYPT_SETTINGS, META_NONCE};
pub use crate::model::{Base, Change, Factory, ModelError, State};
