//! The deck: a bounded LRU cache of open databases keyed by path, giving a
//! process one shared handle per database with per-entry locking.

use std::fs::{self, File};
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use lru::LruCache;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex as EntryMutex, RawMutex};

use crate::db::{
    derive_key, write_meta_file, CreateOptions, Database, DatabaseError, DatabaseResult,
    OpenOptions, SpliceOptions, FILE_NAME_LOG, FILE_NAME_META,
};
use crate::meta::{read_meta_file, Meta};
use crate::model::Factory;

struct DeckEntry<F: Factory> {
    key: Vec<u8>,
    meta: StdMutex<Meta>,
    db: Arc<EntryMutex<Database<F>>>,
}

/// Exclusive access to a cached database, released on drop. Returned by
/// [`Deck::open`].
pub struct DeckGuard<F: Factory> {
    db: ArcMutexGuard<RawMutex, Database<F>>,
}

impl<F: Factory> Deref for DeckGuard<F> {
    type Target = Database<F>;

    fn deref(&self) -> &Database<F> {
        &self.db
    }
}

impl<F: Factory> DerefMut for DeckGuard<F> {
    fn deref_mut(&mut self) -> &mut Database<F> {
        &mut self.db
    }
}

/// An LRU cache of open databases. The cache never holds two handles to the
/// same path; eviction closes the evicted handle once its current user lets
/// go of the per-entry lock.
pub struct Deck<F: Factory> {
    entries: StdMutex<LruCache<PathBuf, Arc<DeckEntry<F>>>>,
}

impl<F: Factory> Deck<F>
where
    F::Base: Send,
    F::State: Send,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: StdMutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a database and caches the open handle.
    pub fn create(
        &self,
        factory: &F,
        path: impl AsRef<Path>,
        options: CreateOptions,
    ) -> DatabaseResult<()> {
        let path = path.as_ref();
        let mut entries = self.lock_entries();
        let db = Database::create(factory, path, options)?;
        Self::insert(&mut entries, path, db);
        Ok(())
    }

    /// Closes and evicts the cached handle if any, then removes the whole
    /// database directory.
    pub fn delete(&self, path: impl AsRef<Path>) -> DatabaseResult<()> {
        let path = path.as_ref();
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.pop(path) {
            close_entry(&entry)?;
        }
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DatabaseError::Io {
                path: path.to_path_buf(),
                source: err,
            }),
        }
    }

    /// The database's meta header: from the cached handle on a hit, straight
    /// from the file on a miss (without opening the database).
    pub fn meta(&self, path: impl AsRef<Path>) -> DatabaseResult<Meta> {
        let path = path.as_ref();
        {
            let mut entries = self.lock_entries();
            if let Some(entry) = entries.get(path) {
                return Ok(entry.meta.lock().expect("deck meta lock poisoned").clone());
            }
        }
        Ok(read_meta_file(path.join(FILE_NAME_META))?)
    }

    /// Replaces the meta header: through the cached handle (file and memory)
    /// on a hit, as a bare file rewrite on a miss.
    pub fn set_meta(&self, path: impl AsRef<Path>, meta: Meta) -> DatabaseResult<()> {
        let path = path.as_ref();
        let entry = {
            let mut entries = self.lock_entries();
            entries.get(path).map(Arc::clone)
        };
        match entry {
            Some(entry) => {
                entry.db.lock().set_meta(meta.clone())?;
                *entry.meta.lock().expect("deck meta lock poisoned") = meta;
                Ok(())
            }
            None => write_meta_file(path, &meta, 0o644),
        }
    }

    /// The log length: from the cached handle on a hit, a streamed entry
    /// count over the raw log file on a miss. An absent log counts zero.
    pub fn log_len(&self, path: impl AsRef<Path>) -> DatabaseResult<u64> {
        let path = path.as_ref();
        let entry = {
            let mut entries = self.lock_entries();
            entries.get(path).map(Arc::clone)
        };
        match entry {
            Some(entry) => Ok(entry.db.lock().log_len()),
            None => read_log_len_from_file(&path.join(FILE_NAME_LOG)),
        }
    }

    /// Returns the cached handle, opening and caching it on a miss. The key
    /// derived from `options` must match the cached handle's key byte for
    /// byte; a mismatch fails with [`DatabaseError::InvalidKey`] before the
    /// per-entry lock is touched.
    pub fn open(
        &self,
        factory: &F,
        path: impl AsRef<Path>,
        options: OpenOptions,
    ) -> DatabaseResult<DeckGuard<F>> {
        let path = path.as_ref();
        let mut entries = self.lock_entries();

        if let Some(entry) = entries.get(path) {
            let entry = Arc::clone(entry);
            drop(entries);

            let mut meta = entry.meta.lock().expect("deck meta lock poisoned").clone();
            let key = derive_key(options.key_fn.as_ref(), &mut meta)?;
            if key != entry.key {
                return Err(DatabaseError::InvalidKey);
            }
            return Ok(DeckGuard {
                db: entry.db.lock_arc(),
            });
        }

        let db = Database::open(factory, path, options)?;
        let entry = Self::insert(&mut entries, path, db);
        drop(entries);
        Ok(DeckGuard {
            db: entry.db.lock_arc(),
        })
    }

    /// Runs `f` on the (possibly freshly opened) handle with the per-entry
    /// lock held.
    pub fn with_open<T>(
        &self,
        factory: &F,
        path: impl AsRef<Path>,
        options: OpenOptions,
        f: impl FnOnce(&mut Database<F>) -> DatabaseResult<T>,
    ) -> DatabaseResult<T> {
        let mut guard = self.open(factory, path, options)?;
        f(&mut guard)
    }

    /// Evicts and closes the cached handle if any, then splices the files on
    /// disk.
    pub fn splice(
        &self,
        factory: &F,
        path: impl AsRef<Path>,
        options: SpliceOptions<F::Change>,
    ) -> DatabaseResult<()> {
        {
            let mut entries = self.lock_entries();
            if let Some(entry) = entries.pop(path.as_ref()) {
                close_entry(&entry)?;
            }
        }
        crate::db::splice(factory, path, options)
    }

    /// Closes every cached database in LRU order.
    pub fn close(&self) -> DatabaseResult<()> {
        let mut entries = self.lock_entries();
        while let Some((_, entry)) = entries.pop_lru() {
            close_entry(&entry)?;
        }
        Ok(())
    }

    fn lock_entries(
        &self,
    ) -> std::sync::MutexGuard<'_, LruCache<PathBuf, Arc<DeckEntry<F>>>> {
        self.entries.lock().expect("deck cache lock poisoned")
    }

    fn insert(
        entries: &mut LruCache<PathBuf, Arc<DeckEntry<F>>>,
        path: &Path,
        db: Database<F>,
    ) -> Arc<DeckEntry<F>> {
        let entry = Arc::new(DeckEntry {
            key: db.key().to_vec(),
            meta: StdMutex::new(db.meta().clone()),
            db: Arc::new(EntryMutex::new(db)),
        });
        if let Some((evicted_path, evicted)) = entries.push(path.to_path_buf(), Arc::clone(&entry))
        {
            if let Err(err) = close_entry(&evicted) {
                tracing::warn!(
                    path = %evicted_path.display(),
                    "failed to close evicted database: {err}"
                );
            }
        }
        entry
    }
}

fn close_entry<F: Factory>(entry: &DeckEntry<F>) -> DatabaseResult<()> {
    entry.db.lock().close()
}

fn read_log_len_from_file(path: &Path) -> DatabaseResult<u64> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(DatabaseError::Io {
                path: path.to_path_buf(),
                source: err,
            })
        }
    };
    let mut reader = crate::log::LogReader::new(BufReader::new(file));
    Ok(crate::log::read_log_len(&mut reader)?)
}
