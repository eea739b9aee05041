//! Core RecordStore implementation

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::id::{decode_id, encode_id};

const RECORD_EXT: &str = "json";
const GUARD_FILE: &str = ".guard";
const TEMP_PREFIX: &str = ".tmp";

/// Modification stamp of a single record file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub modified: SystemTime,
    pub len: u64,
}

/// Record id -> stamp for one category
pub type Fingerprint = BTreeMap<String, Stamp>;

/// Filesystem-backed record store
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

/// Advisory exclusive lock on a category, released on drop
struct CategoryGuard {
    file: File,
}

impl Drop for CategoryGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl RecordStore {
    /// Open or create a store rooted at the given directory
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        debug!(root = %root.display(), "RecordStore::open: called");
        fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;
        // Canonical so watcher event paths can be mapped back to records
        let root = fs::canonicalize(root).map_err(|e| StoreError::io(root, e))?;
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a category
    pub fn category_dir(&self, category: &str) -> PathBuf {
        self.root.join(category)
    }

    /// File path of a record
    pub fn record_path(&self, category: &str, id: &str) -> PathBuf {
        self.category_dir(category)
            .join(format!("{}.{}", encode_id(id), RECORD_EXT))
    }

    /// Map a path inside the store back to its category and record id
    ///
    /// Returns `(category, None)` for paths that are not record files
    /// (category directories, temp files), None for paths outside the store.
    pub fn classify(&self, path: &Path) -> Option<(String, Option<String>)> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        let (last, parents) = parts.split_last()?;

        let record_id = last
            .strip_suffix(&format!(".{}", RECORD_EXT))
            .filter(|stem| !stem.starts_with('.'))
            .and_then(decode_id);

        match record_id {
            Some(id) if !parents.is_empty() => Some((parents.join("/"), Some(id))),
            Some(_) => None,
            None if last.starts_with('.') => Some((parents.join("/"), None)).filter(|(c, _)| !c.is_empty()),
            None => Some((parts.join("/"), None)),
        }
    }

    /// Atomically write (insert or replace) a record
    pub fn put<T: Serialize>(&self, category: &str, id: &str, record: &T) -> StoreResult<()> {
        debug!(%category, %id, "RecordStore::put: called");
        let staged = self.stage(category, record)?;
        let path = self.record_path(category, id);
        staged.persist(&path).map_err(|e| StoreError::io(&path, e.error))?;
        Ok(())
    }

    /// Create a record only if no record with this id exists
    ///
    /// The record becomes visible complete or not at all. Fails with
    /// [`StoreError::AlreadyExists`] when another writer got there first.
    pub fn create<T: Serialize>(&self, category: &str, id: &str, record: &T) -> StoreResult<()> {
        debug!(%category, %id, "RecordStore::create: called");
        let staged = self.stage(category, record)?;
        let path = self.record_path(category, id);
        match staged.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                debug!(%category, %id, "RecordStore::create: record already exists");
                Err(StoreError::AlreadyExists {
                    category: category.to_string(),
                    id: id.to_string(),
                })
            }
            Err(e) => Err(StoreError::io(&path, e.error)),
        }
    }

    /// Read a record; missing and corrupt records read as None
    pub fn get<T: DeserializeOwned>(&self, category: &str, id: &str) -> StoreResult<Option<T>> {
        debug!(%category, %id, "RecordStore::get: called");
        read_record(&self.record_path(category, id))
    }

    /// True if a file exists for the record, parseable or not
    pub fn exists(&self, category: &str, id: &str) -> bool {
        self.record_path(category, id).is_file()
    }

    /// List every readable record in a category, sorted by id
    ///
    /// A missing category is an empty list. Corrupt records are skipped.
    pub fn list<T: DeserializeOwned>(&self, category: &str) -> StoreResult<Vec<(String, T)>> {
        debug!(%category, "RecordStore::list: called");
        let mut records = Vec::new();
        for (id, path) in self.record_files(category)? {
            // Records deleted between read_dir and read are simply skipped
            if let Some(record) = read_record(&path)? {
                records.push((id, record));
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(%category, count = records.len(), "RecordStore::list: returning records");
        Ok(records)
    }

    /// Delete a record; returns false if it did not exist
    pub fn delete(&self, category: &str, id: &str) -> StoreResult<bool> {
        debug!(%category, %id, "RecordStore::delete: called");
        remove_file(&self.record_path(category, id))
    }

    /// Delete a record only if the predicate accepts its current content
    pub fn remove_if<T, F>(&self, category: &str, id: &str, predicate: F) -> StoreResult<bool>
    where
        T: DeserializeOwned,
        F: FnOnce(&T) -> bool,
    {
        debug!(%category, %id, "RecordStore::remove_if: called");
        let _guard = self.guard(category)?;
        let path = self.record_path(category, id);
        match read_record::<T>(&path)? {
            Some(current) if predicate(&current) => remove_file(&path),
            _ => Ok(false),
        }
    }

    /// Replace a record with the value returned by `change`, if any
    ///
    /// `change` sees the current record and returns None to leave it alone.
    pub fn update_if<T, F>(&self, category: &str, id: &str, change: F) -> StoreResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&T) -> Option<T>,
    {
        debug!(%category, %id, "RecordStore::update_if: called");
        let _guard = self.guard(category)?;
        let Some(current) = read_record::<T>(&self.record_path(category, id))? else {
            return Ok(None);
        };
        let Some(next) = change(&current) else {
            return Ok(None);
        };
        self.put(category, id, &next)?;
        Ok(Some(next))
    }

    /// Delete a record file that exists but cannot be parsed
    pub fn purge_corrupt<T: DeserializeOwned>(&self, category: &str, id: &str) -> StoreResult<bool> {
        let _guard = self.guard(category)?;
        let path = self.record_path(category, id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        if serde_json::from_slice::<T>(&bytes).is_ok() {
            return Ok(false);
        }
        warn!(path = %path.display(), "Purging corrupt record");
        remove_file(&path)
    }

    /// Modification stamps for every record in a category
    pub fn fingerprint(&self, category: &str) -> StoreResult<Fingerprint> {
        let mut fingerprint = Fingerprint::new();
        for (id, path) in self.record_files(category)? {
            match fs::metadata(&path) {
                Ok(meta) => {
                    let modified = meta.modified().map_err(|e| StoreError::io(&path, e))?;
                    fingerprint.insert(
                        id,
                        Stamp {
                            modified,
                            len: meta.len(),
                        },
                    );
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Ok(fingerprint)
    }

    fn ensure_category(&self, category: &str) -> StoreResult<PathBuf> {
        let dir = self.category_dir(category);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(dir)
    }

    fn stage<T: Serialize>(&self, category: &str, record: &T) -> StoreResult<NamedTempFile> {
        let dir = self.ensure_category(category)?;
        let content = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Serialize {
            category: category.to_string(),
            source,
        })?;
        let mut staged = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)
            .map_err(|e| StoreError::io(&dir, e))?;
        if let Err(e) = staged.write_all(&content).and_then(|_| staged.flush()) {
            return Err(StoreError::io(staged.path(), e));
        }
        Ok(staged)
    }

    fn guard(&self, category: &str) -> StoreResult<CategoryGuard> {
        let path = self.ensure_category(category)?.join(GUARD_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| StoreError::io(&path, e))?;
        Ok(CategoryGuard { file })
    }

    fn record_files(&self, category: &str) -> StoreResult<Vec<(String, PathBuf)>> {
        let dir = self.category_dir(category);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            let Some(id) = name
                .strip_suffix(&format!(".{}", RECORD_EXT))
                .and_then(decode_id)
            else {
                continue;
            };
            files.push((id, path));
        }
        Ok(files)
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt record treated as absent");
            Ok(None)
        }
    }
}

fn remove_file(path: &Path) -> StoreResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}
