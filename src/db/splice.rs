//! The splice compactor: rewrites `(base, log)` into `base.new`/`log.new`,
//! optionally folding a leading slice of the log into the base and re-keying
//! on the way, then swaps the new files in and garbage-collects payloads no
//! longer referenced by anything reachable.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use crate::crypto::{BlockReader, BlockWriter, EncryptedLogReader};
use crate::engine::{decode_change, encode_change, EngineError};
use crate::log::{LogEntryKind, LogRead, LogReader};
use crate::meta::Meta;
use crate::model::{Base, Change, Factory};

use super::{
    build_log_writer, create_new_file, derive_key, file_mode_of, fsync_dir, may_open_read_only,
    DatabaseError, DatabaseResult, LogFile, SpliceOptions, DEFAULT_FILE_MODE, FILE_NAME_BASE,
    FILE_NAME_LOG, FILE_NAME_META, FILE_NAME_NEW_BASE, FILE_NAME_NEW_LOG, FILE_PREFIX_PAYLOAD,
};

enum BaseWriter {
    Plain(File),
    Sealing(BlockWriter<File>),
}

impl Write for BaseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BaseWriter::Plain(file) => file.write(buf),
            BaseWriter::Sealing(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BaseWriter::Plain(file) => file.flush(),
            BaseWriter::Sealing(writer) => writer.flush(),
        }
    }
}

impl BaseWriter {
    fn finish(self) -> io::Result<File> {
        match self {
            BaseWriter::Plain(file) => Ok(file),
            BaseWriter::Sealing(writer) => writer.finish(),
        }
    }
}

/// Rewrites the database at `path`. The rebase selector routes a leading
/// slice of the log into `base.apply`; everything after the first rejection
/// is re-serialized into the new log. Payload files whose ids are advertised
/// by neither the written base nor any surviving change are deleted.
pub fn splice<F: Factory>(
    factory: &F,
    path: impl AsRef<Path>,
    mut options: SpliceOptions<F::Change>,
) -> DatabaseResult<()> {
    let path = path.as_ref();

    let meta_path = path.join(FILE_NAME_META);
    let mut meta = match may_open_read_only(&meta_path)? {
        Some(file) => Meta::read_from(file)?,
        None => Meta::new(),
    };

    let base_path = path.join(FILE_NAME_BASE);
    let log_path = path.join(FILE_NAME_LOG);
    let base_file = may_open_read_only(&base_path)?;
    let log_file = may_open_read_only(&log_path)?;
    let base_mode = base_file
        .as_ref()
        .map(file_mode_of)
        .unwrap_or(DEFAULT_FILE_MODE);
    let log_mode = log_file
        .as_ref()
        .map(file_mode_of)
        .unwrap_or(DEFAULT_FILE_MODE);

    let source_key = derive_key(options.source_key_fn.as_ref(), &mut meta)?;
    let target_key = derive_key(options.target_key_fn.as_ref(), &mut meta)?;

    let new_base_path = path.join(FILE_NAME_NEW_BASE);
    let new_log_path = path.join(FILE_NAME_NEW_LOG);
    remove_stale_temp_file(&new_base_path)?;
    remove_stale_temp_file(&new_log_path)?;

    let new_base_file = create_new_file(&new_base_path, base_mode)?;
    let new_log_file = create_new_file(&new_log_path, log_mode)?;

    let mut base_writer = if target_key.is_empty() {
        BaseWriter::Plain(new_base_file)
    } else {
        BaseWriter::Sealing(BlockWriter::new(
            new_base_file,
            &target_key,
            options.nonce.clone(),
        )?)
    };
    let mut log_writer =
        build_log_writer(LogFile::Open(new_log_file), &target_key, options.nonce.clone())?;

    // Source readers, decrypting with the source key where present.
    let mut plain_base: Option<File> = None;
    let mut sealed_base: Option<BlockReader<File>> = None;
    if let Some(file) = base_file {
        if source_key.is_empty() {
            plain_base = Some(file);
        } else {
            sealed_base = Some(BlockReader::new(file, &source_key)?);
        }
    }
    let base_reader: Option<&mut dyn Read> = match (&mut plain_base, &mut sealed_base) {
        (Some(file), _) => Some(file),
        (_, Some(reader)) => Some(reader),
        _ => None,
    };

    let mut plain_log: Option<LogReader<BufReader<File>>> = None;
    let mut sealed_log: Option<EncryptedLogReader<LogReader<BufReader<File>>>> = None;
    if let Some(file) = log_file {
        let reader = LogReader::new(BufReader::new(file));
        if source_key.is_empty() {
            plain_log = Some(reader);
        } else {
            sealed_log = Some(EncryptedLogReader::new(reader, &source_key)?);
        }
    }
    let log_reader: Option<&mut dyn LogRead> = match (&mut plain_log, &mut sealed_log) {
        (Some(reader), _) => Some(reader),
        (_, Some(reader)) => Some(reader),
        _ => None,
    };

    let mut base = factory.new_base();
    if let Some(reader) = base_reader {
        base.read_from(reader)?;
    }

    let mut payload_ids: HashSet<String> = HashSet::new();
    let mut rebase = true;
    let mut base_written = false;
    let mut index = 0u64;
    let mut rewritten = 0u64;

    if let Some(log) = log_reader {
        loop {
            let entry = match log.read_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    return Err(EngineError::at_entry(index, err.into()).into());
                }
            };
            let change = decode_change(factory, entry.body())
                .map_err(|err| EngineError::at_entry(index, err))?;

            if rebase {
                if options.rebase.selects(&change, index)? {
                    base.apply(&change)?;
                    index += 1;
                    continue;
                }
                rebase = false;
            }

            if !base_written {
                base.write_to(&mut base_writer)?;
                payload_ids.extend(base.payload_ids());
                base_written = true;
            }

            let record = encode_change(&change)?;
            log_writer.write_entry(LogEntryKind::Binary, &record)?;
            payload_ids.extend(change.payload_ids());
            index += 1;
            rewritten += 1;
        }
    }

    if !base_written {
        base.write_to(&mut base_writer)?;
        payload_ids.extend(base.payload_ids());
    }

    drop(log_writer);
    let new_base_file = base_writer
        .finish()
        .map_err(|err| DatabaseError::io(&new_base_path, err))?;
    new_base_file
        .sync_all()
        .map_err(|err| DatabaseError::io(&new_base_path, err))?;
    drop(plain_base);
    drop(sealed_base);
    drop(plain_log);
    drop(sealed_log);

    delete_unreferenced_payloads(path, &payload_ids)?;

    replace_file(&new_base_path, &base_path)?;
    replace_file(&new_log_path, &log_path)?;
    fsync_dir(path)?;

    tracing::debug!(
        path = %path.display(),
        rebased = index - rewritten,
        rewritten,
        "spliced database"
    );

    Ok(())
}

/// A crashed splice leaves `base.new`/`log.new` behind; clearing them here
/// keeps create-exclusive from locking out every retry.
fn remove_stale_temp_file(path: &Path) -> DatabaseResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::warn!(path = %path.display(), "removed stale splice temp file");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(DatabaseError::io(path, err)),
    }
}

fn replace_file(from: &Path, to: &Path) -> DatabaseResult<()> {
    match fs::remove_file(to) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(DatabaseError::io(to, err)),
    }
    fs::rename(from, to).map_err(|err| DatabaseError::io(to, err))
}

fn delete_unreferenced_payloads(path: &Path, keep: &HashSet<String>) -> DatabaseResult<()> {
    let entries = fs::read_dir(path).map_err(|err| DatabaseError::io(path, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| DatabaseError::io(path, err))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(id) = name.strip_prefix(FILE_PREFIX_PAYLOAD) else {
            continue;
        };
        if !keep.contains(id) {
            fs::remove_file(entry.path()).map_err(|err| DatabaseError::io(entry.path(), err))?;
            tracing::debug!(id, "deleted unreferenced payload");
        }
    }
    Ok(())
}
