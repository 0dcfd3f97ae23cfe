//! In-memory adapter for `StateStore`
//!
//! Documents are kept as serialized JSON so a load always goes through the
//! same serde path as the file adapter.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

use crate::domain::StateStore;
use crate::{Result, StateError};

pub struct MemoryStore<T> {
    document: Mutex<Option<String>>,
    _doc: PhantomData<fn() -> T>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            document: Mutex::new(None),
            _doc: PhantomData,
        }
    }

    /// Raw JSON currently held, if any
    pub fn raw(&self) -> Option<String> {
        self.document.lock().clone()
    }
}

impl<T: Serialize> MemoryStore<T> {
    pub fn with_document(doc: &T) -> Result<Self> {
        let store = Self::new();
        *store.document.lock() = Some(serde_json::to_string(doc)?);
        Ok(store)
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StateStore<T> for MemoryStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>> {
        let guard = self.document.lock();
        match guard.as_deref() {
            None => Ok(None),
            Some(text) => serde_json::from_str(text)
                .map(Some)
                .map_err(|e| StateError::corrupted("memory").with_source(e)),
        }
    }

    fn save(&self, doc: &T) -> Result<()> {
        let text = serde_json::to_string(doc)?;
        *self.document.lock() = Some(text);
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.document.lock() = None;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.document.lock().is_some()
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunCheckpoint;

    #[test]
    fn test_memory_roundtrip_and_remove() {
        let store = MemoryStore::<RunCheckpoint>::new();
        assert!(store.load().unwrap().is_none());

        let cp = RunCheckpoint::new(vec!["a".into()], 9.0);
        store.save(&cp).unwrap();
        assert_eq!(store.load().unwrap(), Some(cp));
        assert!(store.raw().unwrap().contains("\"pending_files\""));

        store.remove().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn test_with_document() {
        let cp = RunCheckpoint::new(vec![], 1.0);
        let store = MemoryStore::with_document(&cp).unwrap();
        assert_eq!(store.load().unwrap(), Some(cp));
    }
}
