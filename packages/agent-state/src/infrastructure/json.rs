//! JSON file adapter for `StateStore`
//!
//! Writes go to a temporary file in the destination directory, are fsynced,
//! and then renamed over the target so readers never see a torn document.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::domain::StateStore;
use crate::{Result, StateError};

pub struct JsonFileStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> Result<PathBuf> {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => Ok(p.to_path_buf()),
            Some(_) => Ok(PathBuf::from(".")),
            None => Err(StateError::config(format!(
                "State path has no parent directory: {}",
                self.path.display()
            ))),
        }
    }
}

impl<T> StateStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StateError::corrupted(self.location()).with_source(e))
    }

    fn save(&self, doc: &T) -> Result<()> {
        let _guard = self.write_lock.lock();
        let dir = self.parent_dir()?;
        fs::create_dir_all(&dir)?;

        let bytes = serde_json::to_vec_pretty(doc)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StateError::from(e.error))?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "state document written");
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProcessingIndex, RunCheckpoint};
    use crate::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::<RunCheckpoint>::new(dir.path().join("missing.json"));
        assert!(store.load().unwrap().is_none());
        assert!(!store.exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::<ProcessingIndex>::new(dir.path().join("index.json"));

        let mut index = ProcessingIndex::default();
        index.record("a.py", 1.0, "deadbeef", Some(0.5), Some(7));
        index.add_pending(["b.py"]);
        store.save(&index).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/cp.json");
        let store = JsonFileStore::<RunCheckpoint>::new(&path);

        store.save(&RunCheckpoint::new(vec!["x".into()], 3.0)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::<RunCheckpoint>::new(dir.path().join("cp.json"));
        for i in 0..5 {
            store
                .save(&RunCheckpoint::new(vec![format!("f{}", i)], i as f64))
                .unwrap();
        }

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupted_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, "{ this is not json").unwrap();

        let store = JsonFileStore::<RunCheckpoint>::new(&path);
        let err = store.load().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupted);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::<RunCheckpoint>::new(dir.path().join("cp.json"));
        store.save(&RunCheckpoint::default()).unwrap();

        store.remove().unwrap();
        store.remove().unwrap();
        assert!(!store.exists());
    }
}
