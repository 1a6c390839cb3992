//! The change-replay engine: couples a `(Base, State)` pair to a log reader
//! on open and a log writer for the rest of its life.

use std::io::Read;
use std::sync::{Mutex, RwLock, RwLockReadGuard};

use thiserror::Error;

use crate::log::{LogEntryKind, LogError, LogRead, LogWrite};
use crate::model::{Base, Change, Factory, ModelError, State};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed log: {reason}")]
    MalformedLog { reason: String },
    #[error("change type name too long ({got} bytes, at most 255)")]
    TypeNameTooLong { got: usize },
    #[error("log entry {index}: {source}")]
    AtEntry {
        index: u64,
        #[source]
        source: Box<EngineError>,
    },
    #[error("{0}")]
    Log(#[from] LogError),
    #[error("{0}")]
    Model(#[from] ModelError),
    #[error("database closed")]
    Closed,
}

impl EngineError {
    fn malformed(reason: impl Into<String>) -> Self {
        EngineError::MalformedLog {
            reason: reason.into(),
        }
    }

    pub(crate) fn at_entry(index: u64, source: EngineError) -> Self {
        EngineError::AtEntry {
            index,
            source: Box::new(source),
        }
    }
}

struct Tail {
    writer: Option<Box<dyn LogWrite + Send>>,
    len: u64,
}

/// Replays `(base, log)` into a live state and appends new changes.
///
/// `apply` calls are totally ordered by the state write lock; `state()` hands
/// out shared read guards, so concurrent reads are permitted and block
/// concurrent applies.
pub struct Engine<F: Factory> {
    base: F::Base,
    state: RwLock<F::State>,
    tail: Mutex<Tail>,
}

impl<F: Factory> std::fmt::Debug for Engine<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl<F: Factory> Engine<F> {
    /// An empty database: fresh base, fresh state, zero log length.
    pub fn new(factory: &F, writer: Box<dyn LogWrite + Send>) -> Self {
        let base = factory.new_base();
        let state = factory.new_state(&base);
        Self {
            base,
            state: RwLock::new(state),
            tail: Mutex::new(Tail {
                writer: Some(writer),
                len: 0,
            }),
        }
    }

    /// Reads the base (if any), then replays every log entry into a fresh
    /// state. Any failure aborts with the entry index attached; no partially
    /// replayed state escapes.
    pub fn open(
        factory: &F,
        base: Option<&mut dyn Read>,
        log: Option<&mut dyn LogRead>,
        writer: Box<dyn LogWrite + Send>,
    ) -> EngineResult<Self> {
        let mut base_doc = factory.new_base();
        if let Some(r) = base {
            base_doc.read_from(r)?;
        }

        let mut state = factory.new_state(&base_doc);

        let mut len = 0u64;
        if let Some(log) = log {
            loop {
                let entry = match log.read_entry() {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => return Err(EngineError::at_entry(len, err.into())),
                };
                let change = decode_change(factory, entry.body())
                    .map_err(|err| EngineError::at_entry(len, err))?;
                state
                    .apply(&change)
                    .map_err(|err| EngineError::at_entry(len, err.into()))?;
                len += 1;
            }
        }

        Ok(Self {
            base: base_doc,
            state: RwLock::new(state),
            tail: Mutex::new(Tail {
                writer: Some(writer),
                len,
            }),
        })
    }

    pub fn base(&self) -> &F::Base {
        &self.base
    }

    /// Shared read access to the live state. The guard blocks `apply` for as
    /// long as it is held.
    pub fn state(&self) -> RwLockReadGuard<'_, F::State> {
        self.state.read().expect("state lock poisoned")
    }

    pub fn log_len(&self) -> u64 {
        self.tail.lock().expect("log tail lock poisoned").len
    }

    /// Applies one change: mutate the state, then append the encoded record
    /// to the log.
    ///
    /// The order is part of the contract: if the state accepts the change but
    /// the log write fails, memory is one change ahead of disk until the
    /// process ends. The error is returned either way; a reopen converges on
    /// whatever the log persisted. A failed `state.apply` leaves the log
    /// untouched.
    pub fn apply(&self, change: &F::Change) -> EngineResult<()> {
        let mut state = self.state.write().expect("state lock poisoned");
        state.apply(change)?;

        let record = encode_change(change)?;

        let mut tail = self.tail.lock().expect("log tail lock poisoned");
        let writer = tail.writer.as_mut().ok_or(EngineError::Closed)?;
        writer.write_entry(LogEntryKind::Binary, &record)?;
        tail.len += 1;

        Ok(())
    }

    /// Drops the log writer. Subsequent `apply` calls fail with `Closed`.
    pub fn close(&self) {
        self.tail.lock().expect("log tail lock poisoned").writer = None;
    }
}

/// Encodes a change record body: `u8 name_len | name | change payload`.
pub(crate) fn encode_change<C: Change>(change: &C) -> EngineResult<Vec<u8>> {
    let name = change.type_name();
    if name.len() > u8::MAX as usize {
        return Err(EngineError::TypeNameTooLong { got: name.len() });
    }

    let mut buf = Vec::with_capacity(1 + name.len() + 64);
    buf.push(name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    change.write_to(&mut buf)?;
    Ok(buf)
}

/// Decodes a change record body and instantiates the change via the factory.
pub(crate) fn decode_change<F: Factory>(factory: &F, body: &[u8]) -> EngineResult<F::Change> {
    let (&name_len, rest) = body
        .split_first()
        .ok_or_else(|| EngineError::malformed("empty change record"))?;
    let name_len = name_len as usize;
    if rest.len() < name_len {
        return Err(EngineError::malformed("truncated change type name"));
    }

    let name = std::str::from_utf8(&rest[..name_len])
        .map_err(|_| EngineError::malformed("change type name is not utf-8"))?;

    let mut change = factory.new_change(name)?;
    let mut payload = &rest[name_len..];
    change.read_from(&mut payload)?;
    Ok(change)
}
