//! Domain layer for persisted run state
//!
//! # Documents
//!
//! - `ProcessingIndex`: per-file fingerprints recorded after successful processing
//! - `RunCheckpoint`: progress of the current (or last interrupted) run
//!
//! Each document has exactly one owning component in the engine, and that
//! component is the only writer of its backing store.
//!
//! # Port Trait
//!
//! - `StateStore<T>`: load/save/remove of a whole document
//!
//! # Examples
//!
//! ```rust
//! use agent_state::domain::{ProcessingIndex, StateStore};
//! use agent_state::infrastructure::MemoryStore;
//!
//! let store = MemoryStore::<ProcessingIndex>::new();
//! let mut index = ProcessingIndex::default();
//! index.record("src/lib.rs", 1_700_000_000.0, "abc123", Some(1_699_999_999.0), Some(42));
//! store.save(&index).unwrap();
//!
//! let loaded = store.load().unwrap().unwrap();
//! assert_eq!(loaded.entry("src/lib.rs").unwrap().content_hash, "abc123");
//! ```

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::Result;

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ═══════════════════════════════════════════════════════════════════════════
// Processing Index
// ═══════════════════════════════════════════════════════════════════════════

/// Borrowed view of one file's recorded state
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry<'a> {
    /// When the file was last processed successfully (epoch seconds)
    pub last_processed: f64,
    /// Hex BLAKE3 digest of the content at that time
    pub content_hash: &'a str,
    /// File mtime observed when recorded (absent in older documents)
    pub mtime: Option<f64>,
    /// File size observed when recorded (absent in older documents)
    pub size: Option<u64>,
}

/// Persisted incremental-processing index
///
/// Serialized layout:
///
/// ```json
/// {
///   "last_run_timestamp": 1700000000.5,
///   "processed_files": {"a.py": 1700000000.1},
///   "file_hashes": {"a.py": "af13..."},
///   "file_mtimes": {"a.py": 1699999990.0},
///   "file_sizes": {"a.py": 120},
///   "pending_files": ["b.py"]
/// }
/// ```
///
/// `file_mtimes` and `file_sizes` are optional on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingIndex {
    #[serde(default)]
    pub last_run_timestamp: f64,
    #[serde(default)]
    pub processed_files: BTreeMap<String, f64>,
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_mtimes: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_sizes: BTreeMap<String, u64>,
    #[serde(default)]
    pub pending_files: Vec<String>,
}

impl ProcessingIndex {
    pub fn entry(&self, path: &str) -> Option<IndexEntry<'_>> {
        let last_processed = *self.processed_files.get(path)?;
        let content_hash = self.file_hashes.get(path)?;
        Some(IndexEntry {
            last_processed,
            content_hash,
            mtime: self.file_mtimes.get(path).copied(),
            size: self.file_sizes.get(path).copied(),
        })
    }

    /// Record a successful processing of `path` and drop it from the pending set
    pub fn record(
        &mut self,
        path: impl Into<String>,
        processed_at: f64,
        content_hash: impl Into<String>,
        mtime: Option<f64>,
        size: Option<u64>,
    ) {
        let path = path.into();
        self.processed_files.insert(path.clone(), processed_at);
        self.file_hashes.insert(path.clone(), content_hash.into());
        match mtime {
            Some(m) => self.file_mtimes.insert(path.clone(), m),
            None => self.file_mtimes.remove(&path),
        };
        match size {
            Some(s) => self.file_sizes.insert(path.clone(), s),
            None => self.file_sizes.remove(&path),
        };
        self.remove_pending(&path);
    }

    /// Forget everything recorded for `path`
    pub fn forget(&mut self, path: &str) {
        self.processed_files.remove(path);
        self.file_hashes.remove(path);
        self.file_mtimes.remove(path);
        self.file_sizes.remove(path);
        self.remove_pending(path);
    }

    /// Append paths to the pending set, keeping first-insertion order
    pub fn add_pending<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen: HashSet<String> = self.pending_files.iter().cloned().collect();
        for path in paths {
            let path = path.into();
            if seen.insert(path.clone()) {
                self.pending_files.push(path);
            }
        }
    }

    pub fn remove_pending(&mut self, path: &str) -> bool {
        let before = self.pending_files.len();
        self.pending_files.retain(|p| p != path);
        before != self.pending_files.len()
    }

    /// Close out a run: stamp the run time and clear the pending set
    pub fn complete_run(&mut self, now: f64) {
        self.last_run_timestamp = now;
        self.pending_files.clear();
    }

    pub fn len(&self) -> usize {
        self.processed_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed_files.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Run Checkpoint
// ═══════════════════════════════════════════════════════════════════════════

/// Durable progress record for a run
///
/// Serialized layout:
///
/// ```json
/// {
///   "shutdown_requested": false,
///   "current_file": "b.py",
///   "completed_files": ["a.py"],
///   "pending_files": ["b.py", "c.py"],
///   "start_time": 1700000000.0
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    #[serde(default)]
    pub shutdown_requested: bool,
    #[serde(default)]
    pub current_file: Option<String>,
    #[serde(default)]
    pub completed_files: Vec<String>,
    #[serde(default)]
    pub pending_files: Vec<String>,
    #[serde(default)]
    pub start_time: f64,
}

impl RunCheckpoint {
    pub fn new(pending_files: Vec<String>, start_time: f64) -> Self {
        Self {
            pending_files,
            start_time,
            ..Default::default()
        }
    }

    /// Move `path` from pending to completed
    ///
    /// Completing the same path twice is a no-op.
    pub fn mark_completed(&mut self, path: &str) {
        self.pending_files.retain(|p| p != path);
        if !self.completed_files.iter().any(|p| p == path) {
            self.completed_files.push(path.to_string());
        }
        if self.current_file.as_deref() == Some(path) {
            self.current_file = None;
        }
    }

    /// Replace the pending list; paths already completed are filtered out
    pub fn set_pending(&mut self, pending: Vec<String>) {
        let done: HashSet<&str> = self.completed_files.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        self.pending_files = pending
            .into_iter()
            .filter(|p| !done.contains(p.as_str()) && seen.insert(p.clone()))
            .collect();
    }

    pub fn is_completed(&self, path: &str) -> bool {
        self.completed_files.iter().any(|p| p == path)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Whole-document persistence for one state document type
///
/// `save` must be atomic with respect to readers: a concurrent or later
/// `load` observes either the previous document or the new one, never a
/// partial write.
pub trait StateStore<T>: Send + Sync
where
    T: Serialize + DeserializeOwned,
{
    /// Load the document. `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<T>>;

    /// Replace the stored document
    fn save(&self, doc: &T) -> Result<()>;

    /// Delete the stored document (no-op when absent)
    fn remove(&self) -> Result<()>;

    fn exists(&self) -> bool;

    /// Human-readable location for log messages
    fn location(&self) -> String;
}
