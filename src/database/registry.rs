use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::{Database, DatabaseOptions};
use crate::common::Result;

/// Hands out one shared `Database` per set of files, so two callers opening
/// the same path do not run two caches over one data file.
///
/// Entries are weak; a database closes when its last handle is dropped.
#[derive(Default)]
pub struct DatabaseRegistry {
    open: Mutex<HashMap<PathBuf, Weak<Database>>>,
}

impl DatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the open database at `path`, or opens it with `options`.
    /// Options are ignored when the database is already open.
    pub fn open<P: AsRef<Path>>(&self, path: P, options: DatabaseOptions) -> Result<Arc<Database>> {
        let key = canonical_key(path.as_ref());
        let mut open = self.open.lock();
        if let Some(db) = open.get(&key).and_then(Weak::upgrade) {
            if !db.is_closed() {
                return Ok(db);
            }
        }

        let db = Arc::new(Database::open(path.as_ref(), options)?);
        open.retain(|_, weak| weak.strong_count() > 0);
        open.insert(key, Arc::downgrade(&db));
        debug!(path = %path.as_ref().display(), "registered database");
        Ok(db)
    }

    /// The database at `path` if it is open.
    pub fn get<P: AsRef<Path>>(&self, path: P) -> Option<Arc<Database>> {
        let key = canonical_key(path.as_ref());
        self.open
            .lock()
            .get(&key)
            .and_then(Weak::upgrade)
            .filter(|db| !db.is_closed())
    }

    /// Number of databases still held open by some caller.
    pub fn len(&self) -> usize {
        self.open
            .lock()
            .values()
            .filter(|weak| weak.upgrade().map_or(false, |db| !db.is_closed()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The base path with its directory resolved, so `./db` and `db` match.
/// The base itself names no file, so only the parent is canonicalized.
fn canonical_key(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let parent = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
    match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_path_shares_database() {
        let dir = TempDir::new().unwrap();
        let registry = DatabaseRegistry::new();
        let a = registry
            .open(dir.path().join("db"), DatabaseOptions::new().cache_scale(8))
            .unwrap();
        let b = registry
            .open(dir.path().join(".").join("db"), DatabaseOptions::new())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        let other = registry
            .open(dir.path().join("other"), DatabaseOptions::new().cache_scale(8))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dropped_database_is_reopened() {
        let dir = TempDir::new().unwrap();
        let registry = DatabaseRegistry::new();
        let path = dir.path().join("db");
        let db = registry.open(&path, DatabaseOptions::new().cache_scale(8)).unwrap();
        db.close().unwrap();
        assert!(registry.get(&path).is_none());
        drop(db);
        assert!(registry.is_empty());

        let db = registry.open(&path, DatabaseOptions::new().cache_scale(8)).unwrap();
        assert!(!db.is_closed());
        assert!(registry.get(&path).is_some());
    }
}
