//! Incremental change detection
//!
//! Decides which candidate files need processing by comparing the live file
//! against the fingerprint recorded after its last successful processing.
//!
//! Decision per candidate:
//! - not in the index → changed
//! - cannot be stat'd or read → changed (conservative)
//! - recorded mtime+size equal to live mtime+size → unchanged (no hashing)
//! - otherwise → rehash; changed iff the BLAKE3 digest differs
//!
//! Entries recorded without mtime/size only rehash when the live mtime is
//! newer than the recorded processing timestamp.

use crate::fingerprint::{hash_file, FileFingerprint, FileStat};
use agent_state::{epoch_now, JsonFileStore, MemoryStore, ProcessingIndex, StateStore};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owned copy of an index entry, taken so no I/O happens under the index lock
#[derive(Debug, Clone)]
struct Recorded {
    last_processed: f64,
    content_hash: String,
    mtime: Option<f64>,
    size: Option<u64>,
}

/// Outcome of checking one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// Never processed
    New,
    /// Stat or read failed
    Unreadable,
    /// Metadata moved and the content hash differs
    ContentChanged,
    /// Metadata moved but the content hash is identical
    Touched,
    /// Metadata identical to the recorded state
    Unchanged,
}

impl ChangeReason {
    pub fn is_changed(&self) -> bool {
        matches!(
            self,
            ChangeReason::New | ChangeReason::Unreadable | ChangeReason::ContentChanged
        )
    }
}

pub struct ChangeDetector {
    index: Mutex<ProcessingIndex>,
    store: Arc<dyn StateStore<ProcessingIndex>>,
}

impl ChangeDetector {
    /// Load the index from `store`; unreadable state degrades to an empty index
    pub fn new(store: Arc<dyn StateStore<ProcessingIndex>>) -> Self {
        let index = match store.load() {
            Ok(Some(index)) => {
                info!(
                    "Loaded processing index from {} ({} files tracked)",
                    store.location(),
                    index.len()
                );
                index
            }
            Ok(None) => ProcessingIndex::default(),
            Err(e) => {
                warn!(
                    "Failed to load processing index from {}: {} - reprocessing everything",
                    store.location(),
                    e
                );
                ProcessingIndex::default()
            }
        };

        Self {
            index: Mutex::new(index),
            store,
        }
    }

    /// JSON-backed detector at `path`
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(JsonFileStore::new(path)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Subset of `candidates` that needs processing, in input order
    pub fn get_changed(&self, candidates: &[PathBuf]) -> Vec<PathBuf> {
        let changed: Vec<PathBuf> = candidates
            .iter()
            .filter(|p| self.check(p).is_changed())
            .cloned()
            .collect();

        debug!(
            "Change detection: {} of {} candidates changed",
            changed.len(),
            candidates.len()
        );
        changed
    }

    pub fn is_changed(&self, path: &Path) -> bool {
        self.check(path).is_changed()
    }

    /// Classify one candidate
    pub fn check(&self, path: &Path) -> ChangeReason {
        let key = path_key(path);
        let recorded = {
            let index = self.index.lock();
            index.entry(&key).map(|e| Recorded {
                last_processed: e.last_processed,
                content_hash: e.content_hash.to_string(),
                mtime: e.mtime,
                size: e.size,
            })
        };

        let Some(recorded) = recorded else {
            return ChangeReason::New;
        };

        let stat = match FileStat::of(path) {
            Ok(stat) => stat,
            Err(e) => {
                debug!("Cannot stat {}: {} - treating as changed", key, e);
                return ChangeReason::Unreadable;
            }
        };

        let needs_hash = match (recorded.mtime, recorded.size) {
            (Some(mtime), Some(size)) => stat.mtime != mtime || stat.size != size,
            _ => stat.mtime > recorded.last_processed,
        };
        if !needs_hash {
            return ChangeReason::Unchanged;
        }

        match hash_file(path) {
            Ok(hash) if hash == recorded.content_hash => ChangeReason::Touched,
            Ok(_) => ChangeReason::ContentChanged,
            Err(e) => {
                debug!("Cannot hash {}: {} - treating as changed", key, e);
                ChangeReason::Unreadable
            }
        }
    }

    /// Record the current fingerprint of `path` and persist the index
    ///
    /// Returns false when the file could not be fingerprinted; it then stays
    /// "changed" for the next run.
    pub fn mark_processed(&self, path: &Path) -> bool {
        let fingerprint = match FileFingerprint::compute(path) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(
                    "Cannot fingerprint {} after processing: {}",
                    path.display(),
                    e
                );
                return false;
            }
        };

        let mut index = self.index.lock();
        index.record(
            path_key(path),
            epoch_now(),
            fingerprint.content_hash,
            Some(fingerprint.mtime),
            Some(fingerprint.size),
        );
        self.persist(&index);
        true
    }

    /// Add paths to the pending set (persisted)
    pub fn set_pending(&self, paths: &[PathBuf]) {
        let mut index = self.index.lock();
        index.add_pending(paths.iter().map(|p| path_key(p)));
        self.persist(&index);
    }

    pub fn pending(&self) -> Vec<String> {
        self.index.lock().pending_files.clone()
    }

    /// Stamp the run, clear pending files, persist
    pub fn complete_run(&self) {
        let mut index = self.index.lock();
        index.complete_run(epoch_now());
        self.persist(&index);
        info!("Run completed - {} files tracked", index.len());
    }

    /// Discard all state and delete the persisted index
    pub fn reset(&self) {
        let mut index = self.index.lock();
        *index = ProcessingIndex::default();
        if let Err(e) = self.store.remove() {
            warn!(
                "Failed to delete processing index {}: {}",
                self.store.location(),
                e
            );
        }
        info!("Processing index reset - next run reprocesses everything");
    }

    /// Write the current index; false (and a warning) on failure
    pub fn flush(&self) -> bool {
        let index = self.index.lock();
        self.persist(&index)
    }

    pub fn snapshot(&self) -> ProcessingIndex {
        self.index.lock().clone()
    }

    pub fn tracked_files(&self) -> usize {
        self.index.lock().len()
    }

    pub fn last_run_timestamp(&self) -> f64 {
        self.index.lock().last_run_timestamp
    }

    fn persist(&self, index: &ProcessingIndex) -> bool {
        match self.store.save(index) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Failed to persist processing index to {}: {}",
                    self.store.location(),
                    e
                );
                false
            }
        }
    }
}

pub(crate) fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
