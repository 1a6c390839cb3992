//! Filesystem database: binds the codec, crypto and replay engine to a
//! directory holding `meta`, `base`, `log` and `payload-<id>` files.

mod options;
mod payload;
mod splice;

pub use options::{
    static_key, CreateOptions, KeyError, KeyFn, OpenOptions, Rebase, SpliceOptions,
};
pub(crate) use options::derive_key;
pub use payload::{Payload, PayloadReader};
pub use splice::splice;

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLockReadGuard;

use thiserror::Error;

use crate::crypto::{
    chain_contains_invalid_key, BlockReader, BlockWriter, CryptoError, EncryptedLogReader,
    EncryptedLogWriter, NonceSource,
};
use crate::engine::{Engine, EngineError};
use crate::log::{LogError, LogRead, LogReader, LogWrite, LogWriter};
use crate::meta::{Meta, MetaError};
use crate::model::{Factory, ModelError};

pub const FILE_NAME_META: &str = "meta";
pub const FILE_NAME_BASE: &str = "base";
pub const FILE_NAME_LOG: &str = "log";
pub const FILE_NAME_NEW_BASE: &str = "base.new";
pub const FILE_NAME_NEW_LOG: &str = "log.new";
pub const FILE_PREFIX_PAYLOAD: &str = "payload-";

const META_TEMP_NAME: &str = "meta.tmp";
const DEFAULT_FILE_MODE: u32 = 0o644;

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database missing")]
    Missing,
    #[error("database already exists")]
    Existing,
    #[error("invalid key")]
    InvalidKey,
    #[error("payload missing")]
    PayloadMissing,
    #[error("payload id {id:?} already exists")]
    PayloadIdAlreadyExists { id: String },
    #[error("{0}")]
    Key(#[from] KeyError),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Meta(#[from] MetaError),
    #[error("{0}")]
    Crypto(CryptoError),
    #[error("{0}")]
    Engine(EngineError),
    #[error("{0}")]
    Log(LogError),
    #[error("{0}")]
    Model(ModelError),
}

impl DatabaseError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DatabaseError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<CryptoError> for DatabaseError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKey => DatabaseError::InvalidKey,
            other => DatabaseError::Crypto(other),
        }
    }
}

impl From<EngineError> for DatabaseError {
    fn from(err: EngineError) -> Self {
        if chain_contains_invalid_key(&err) {
            return DatabaseError::InvalidKey;
        }
        DatabaseError::Engine(err)
    }
}

impl From<LogError> for DatabaseError {
    fn from(err: LogError) -> Self {
        if chain_contains_invalid_key(&err) {
            return DatabaseError::InvalidKey;
        }
        DatabaseError::Log(err)
    }
}

impl From<ModelError> for DatabaseError {
    fn from(err: ModelError) -> Self {
        if chain_contains_invalid_key(&err) {
            return DatabaseError::InvalidKey;
        }
        DatabaseError::Model(err)
    }
}

/// The log file behind the writer half. `Pending` covers a database opened
/// before its log exists; the file appears on the first append.
pub(crate) enum LogFile {
    Open(File),
    Pending { path: PathBuf, mode: u32 },
}

impl LogFile {
    fn file(&mut self) -> io::Result<&mut File> {
        if let LogFile::Pending { path, mode } = self {
            let mut opts = fs::OpenOptions::new();
            opts.append(true).create(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(*mode);
            }
            let file = opts.open(&*path)?;
            *self = LogFile::Open(file);
        }
        match self {
            LogFile::Open(file) => Ok(file),
            LogFile::Pending { .. } => unreachable!("log file opened above"),
        }
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    // Full fsync per flush; the log writer flushes once per entry, which
    // makes every appended entry durable before `apply` returns.
    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogFile::Open(file) => {
                file.flush()?;
                file.sync_all()
            }
            LogFile::Pending { .. } => Ok(()),
        }
    }
}

pub struct Database<F: Factory> {
    path: PathBuf,
    file_mode: u32,
    meta: Meta,
    key: Vec<u8>,
    nonce: NonceSource,
    engine: Engine<F>,
}

impl<F: Factory> fmt::Debug for Database<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("file_mode", &self.file_mode)
            .field("meta", &self.meta)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl<F: Factory> Database<F> {
    /// Creates a fresh database directory. Fails with [`DatabaseError::Existing`]
    /// if a log file is already present.
    pub fn create(
        factory: &F,
        path: impl AsRef<Path>,
        options: CreateOptions,
    ) -> DatabaseResult<Self> {
        let path = path.as_ref();
        create_dir_all_mode(path, options.directory_mode)?;

        let mut meta = options.meta;
        let key = derive_key(options.key_fn.as_ref(), &mut meta)?;

        if !meta.is_empty() {
            let meta_path = path.join(FILE_NAME_META);
            let mut meta_file = create_new_file(&meta_path, options.file_mode)?;
            meta.write_to(&mut meta_file)
                .map_err(|err| DatabaseError::io(&meta_path, err))?;
            meta_file
                .sync_all()
                .map_err(|err| DatabaseError::io(&meta_path, err))?;
        }

        let log_path = path.join(FILE_NAME_LOG);
        let log_file = create_new_file(&log_path, options.file_mode)?;

        let writer = build_log_writer(LogFile::Open(log_file), &key, options.nonce.clone())?;
        let engine = Engine::new(factory, writer);

        tracing::debug!(
            path = %path.display(),
            encrypted = !key.is_empty(),
            "created database"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file_mode: options.file_mode,
            meta,
            key,
            nonce: options.nonce,
            engine,
        })
    }

    /// Opens an existing database and replays its log. Fails with
    /// [`DatabaseError::Missing`] when neither base nor log is present, and
    /// with [`DatabaseError::InvalidKey`] when the derived key does not
    /// authenticate.
    pub fn open(factory: &F, path: impl AsRef<Path>, options: OpenOptions) -> DatabaseResult<Self> {
        let path = path.as_ref();

        let meta_path = path.join(FILE_NAME_META);
        let mut meta = match may_open_read_only(&meta_path)? {
            Some(file) => Meta::read_from(file)?,
            None => Meta::new(),
        };

        let base_file = may_open_read_only(&path.join(FILE_NAME_BASE))?;

        let log_path = path.join(FILE_NAME_LOG);
        let log_file = may_open_read_write(&log_path)?;

        if base_file.is_none() && log_file.is_none() {
            return Err(DatabaseError::Missing);
        }

        let file_mode = log_file
            .as_ref()
            .map(file_mode_of)
            .unwrap_or(DEFAULT_FILE_MODE);

        let key = derive_key(options.key_fn.as_ref(), &mut meta)?;

        // The reader clone shares the file offset with the writer handle, so
        // once replay consumes the log to EOF, appends continue in place.
        let log_reader_file = match &log_file {
            Some(file) => Some(file.try_clone().map_err(|err| DatabaseError::io(&log_path, err))?),
            None => None,
        };
        let writer_file = match log_file {
            Some(file) => LogFile::Open(file),
            None => LogFile::Pending {
                path: log_path.clone(),
                mode: file_mode,
            },
        };
        let writer = build_log_writer(writer_file, &key, options.nonce.clone())?;

        let mut plain_base: Option<File> = None;
        let mut sealed_base: Option<BlockReader<File>> = None;
        if let Some(file) = base_file {
            if key.is_empty() {
                plain_base = Some(file);
            } else {
                sealed_base = Some(BlockReader::new(file, &key)?);
            }
        }
        let base_reader: Option<&mut dyn Read> = match (&mut plain_base, &mut sealed_base) {
            (Some(file), _) => Some(file),
            (_, Some(reader)) => Some(reader),
            _ => None,
        };

        let mut plain_log: Option<LogReader<BufReader<File>>> = None;
        let mut sealed_log: Option<EncryptedLogReader<LogReader<BufReader<File>>>> = None;
        if let Some(file) = log_reader_file {
            let reader = LogReader::new(BufReader::new(file));
            if key.is_empty() {
                plain_log = Some(reader);
            } else {
                sealed_log = Some(EncryptedLogReader::new(reader, &key)?);
            }
        }
        let log_reader: Option<&mut dyn LogRead> = match (&mut plain_log, &mut sealed_log) {
            (Some(reader), _) => Some(reader),
            (_, Some(reader)) => Some(reader),
            _ => None,
        };

        let engine = Engine::open(factory, base_reader, log_reader, writer)?;

        tracing::debug!(
            path = %path.display(),
            log_len = engine.log_len(),
            "opened database"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file_mode,
            meta,
            key,
            nonce: options.nonce,
            engine,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base(&self) -> &F::Base {
        self.engine.base()
    }

    /// Shared read access to the live state.
    pub fn state(&self) -> RwLockReadGuard<'_, F::State> {
        self.engine.state()
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn log_len(&self) -> u64 {
        self.engine.log_len()
    }

    /// Applies a change with no payloads.
    pub fn apply(&self, change: &F::Change) -> DatabaseResult<()> {
        self.apply_with(change, Vec::new())
    }

    /// Writes every payload file, then applies the change. A payload id that
    /// already exists on disk fails the whole call before the change touches
    /// the state or the log.
    pub fn apply_with<'p>(
        &self,
        change: &F::Change,
        payloads: impl IntoIterator<Item = Payload<'p>>,
    ) -> DatabaseResult<()> {
        for mut payload in payloads {
            let payload_path = self.payload_path(&payload.id);
            let file = match create_new_file(&payload_path, self.file_mode) {
                Ok(file) => file,
                Err(DatabaseError::Existing) => {
                    return Err(DatabaseError::PayloadIdAlreadyExists {
                        id: payload.id.clone(),
                    })
                }
                Err(err) => return Err(err),
            };

            let file = if self.key.is_empty() {
                let mut file = file;
                io::copy(&mut payload.source, &mut file)
                    .map_err(|err| DatabaseError::io(&payload_path, err))?;
                file
            } else {
                let mut writer = BlockWriter::new(file, &self.key, self.nonce.clone())?;
                io::copy(&mut payload.source, &mut writer)
                    .map_err(|err| DatabaseError::io(&payload_path, err))?;
                writer
                    .finish()
                    .map_err(|err| DatabaseError::io(&payload_path, err))?
            };
            file.sync_all()
                .map_err(|err| DatabaseError::io(&payload_path, err))?;
        }

        self.engine.apply(change).map_err(DatabaseError::from)
    }

    /// Opens the payload file for `id`, decrypting when the database carries
    /// a key.
    pub fn open_payload(&self, id: &str) -> DatabaseResult<PayloadReader> {
        let path = self.payload_path(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(DatabaseError::PayloadMissing)
            }
            Err(err) => return Err(DatabaseError::io(&path, err)),
        };

        if self.key.is_empty() {
            Ok(PayloadReader::plain(file))
        } else {
            Ok(PayloadReader::decrypting(BlockReader::new(file, &self.key)?))
        }
    }

    /// Size and timestamps of the payload file as stored (encrypted sizes
    /// include nonce and framing overhead).
    pub fn stat_payload(&self, id: &str) -> DatabaseResult<fs::Metadata> {
        let path = self.payload_path(id);
        match fs::metadata(&path) {
            Ok(stat) => Ok(stat),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(DatabaseError::PayloadMissing)
            }
            Err(err) => Err(DatabaseError::io(&path, err)),
        }
    }

    /// Atomically rewrites the meta file and replaces the in-memory copy.
    pub fn set_meta(&mut self, meta: Meta) -> DatabaseResult<()> {
        write_meta_file(&self.path, &meta, self.file_mode)?;
        self.meta = meta;
        Ok(())
    }

    /// Closes the log writer. Later `apply` calls fail; reads keep working.
    pub fn close(&mut self) -> DatabaseResult<()> {
        self.engine.close();
        Ok(())
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        self.path.join(format!("{FILE_PREFIX_PAYLOAD}{id}"))
    }
}

fn build_log_writer(
    file: LogFile,
    key: &[u8],
    nonce: NonceSource,
) -> Result<Box<dyn LogWrite + Send>, CryptoError> {
    let writer = LogWriter::new(file);
    if key.is_empty() {
        Ok(Box::new(writer))
    } else {
        Ok(Box::new(EncryptedLogWriter::new(writer, key, nonce)?))
    }
}

fn create_dir_all_mode(path: &Path, mode: u32) -> DatabaseResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder
        .create(path)
        .map_err(|err| DatabaseError::io(path, err))
}

pub(crate) fn create_new_file(path: &Path, mode: u32) -> DatabaseResult<File> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    match opts.open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(DatabaseError::Existing),
        Err(err) => Err(DatabaseError::io(path, err)),
    }
}

pub(crate) fn may_open_read_only(path: &Path) -> DatabaseResult<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DatabaseError::io(path, err)),
    }
}

fn may_open_read_write(path: &Path) -> DatabaseResult<Option<File>> {
    match fs::OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(DatabaseError::io(path, err)),
    }
}

pub(crate) fn file_mode_of(file: &File) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = file.metadata() {
            return meta.permissions().mode() & 0o777;
        }
    }
    #[cfg(not(unix))]
    let _ = file;
    DEFAULT_FILE_MODE
}

/// Rewrites `<dir>/meta` through a temp file and rename, syncing the
/// directory afterwards.
pub(crate) fn write_meta_file(dir: &Path, meta: &Meta, mode: u32) -> DatabaseResult<()> {
    let temp_path = dir.join(META_TEMP_NAME);
    let final_path = dir.join(FILE_NAME_META);

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = opts
        .open(&temp_path)
        .map_err(|err| DatabaseError::io(&temp_path, err))?;

    meta.write_to(&mut file)
        .map_err(|err| DatabaseError::io(&temp_path, err))?;
    file.sync_all()
        .map_err(|err| DatabaseError::io(&temp_path, err))?;

    fs::rename(&temp_path, &final_path).map_err(|err| DatabaseError::io(&final_path, err))?;
    fsync_dir(dir)?;
    Ok(())
}

pub(crate) fn fsync_dir(dir: &Path) -> DatabaseResult<()> {
    let file = File::open(dir).map_err(|err| DatabaseError::io(dir, err))?;
    file.sync_all().map_err(|err| DatabaseError::io(dir, err))
}
