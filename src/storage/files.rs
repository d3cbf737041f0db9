use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::common::Result;

/// Names of the files that make up one database, all derived from a base path.
///
/// For base `dir/db` these are `dir/db.properties`, `dir/db.script`,
/// `dir/db.data`, `dir/db.backup` and `dir/db.log`, plus the `.new`
/// variants a checkpoint writes before renaming them into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseFiles {
    base: PathBuf,
}

impl DatabaseFiles {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn properties(&self) -> PathBuf {
        self.with_suffix(".properties")
    }

    pub fn script(&self) -> PathBuf {
        self.with_suffix(".script")
    }

    pub fn script_new(&self) -> PathBuf {
        self.with_suffix(".script.new")
    }

    pub fn data(&self) -> PathBuf {
        self.with_suffix(".data")
    }

    pub fn data_new(&self) -> PathBuf {
        self.with_suffix(".data.new")
    }

    pub fn backup(&self) -> PathBuf {
        self.with_suffix(".backup")
    }

    pub fn backup_new(&self) -> PathBuf {
        self.with_suffix(".backup.new")
    }

    pub fn log(&self) -> PathBuf {
        self.with_suffix(".log")
    }
}

/// Appends `suffix` to the file name of `path`.
pub fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Deletes `path`; returns false if it did not exist.
pub fn delete_if_exists<P: AsRef<Path>>(path: P) -> Result<bool> {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Moves `from` over `to`, replacing `to` if present.
pub fn rename_overwrite<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> Result<()> {
    if cfg!(windows) {
        delete_if_exists(to.as_ref())?;
    }
    fs::rename(from.as_ref(), to.as_ref())?;
    Ok(())
}

/// Renames `from` over `to` if `from` exists; returns whether it did.
pub fn rename_if_exists<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> Result<bool> {
    if !from.as_ref().exists() {
        return Ok(false);
    }
    rename_overwrite(from, to)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_names() {
        let files = DatabaseFiles::new("/tmp/x/db");
        assert_eq!(files.data(), PathBuf::from("/tmp/x/db.data"));
        assert_eq!(files.script_new(), PathBuf::from("/tmp/x/db.script.new"));
        assert_eq!(files.properties(), PathBuf::from("/tmp/x/db.properties"));
        assert_eq!(
            path_with_suffix(&files.data(), ".new"),
            files.data_new()
        );
    }

    #[test]
    fn test_rename_and_delete() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"new").unwrap();
        fs::write(&b, b"old").unwrap();

        assert!(rename_if_exists(&a, &b).unwrap());
        assert_eq!(fs::read(&b).unwrap(), b"new");
        assert!(!rename_if_exists(&a, &b).unwrap());
        assert!(delete_if_exists(&b).unwrap());
        assert!(!delete_if_exists(&b).unwrap());
    }
}
