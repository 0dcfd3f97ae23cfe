use crate::shutdown::ShutdownSignal;
use agent_state::{epoch_now, JsonFileStore, MemoryStore, RunCheckpoint, StateStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Run lifecycle: RUNNING -> SHUTDOWN_REQUESTED -> STOPPED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    ShutdownRequested,
    Stopped,
}

struct Inner {
    checkpoint: RunCheckpoint,
    phase: RunPhase,
}

/// Durable run progress for interruption and resume
///
/// Every mutator persists synchronously; write failures are logged and the
/// in-memory state stays authoritative for the rest of the run.
pub struct CheckpointStore {
    inner: Mutex<Inner>,
    store: Arc<dyn StateStore<RunCheckpoint>>,
    shutdown: ShutdownSignal,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn StateStore<RunCheckpoint>>, shutdown: ShutdownSignal) -> Self {
        Self {
            inner: Mutex::new(Inner {
                checkpoint: RunCheckpoint::default(),
                phase: RunPhase::Stopped,
            }),
            store,
            shutdown,
        }
    }

    pub fn open(path: impl Into<PathBuf>, shutdown: ShutdownSignal) -> Self {
        Self::new(Arc::new(JsonFileStore::new(path)), shutdown)
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), ShutdownSignal::new())
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Prior interrupted checkpoint, if any, with `shutdown_requested` cleared
    pub fn load_resume_state(&self) -> Option<RunCheckpoint> {
        match self.store.load() {
            Ok(Some(mut checkpoint)) => {
                checkpoint.shutdown_requested = false;
                info!(
                    "Found resumable checkpoint at {}: {} completed, {} pending",
                    self.store.location(),
                    checkpoint.completed_files.len(),
                    checkpoint.pending_files.len()
                );
                Some(checkpoint)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    "Ignoring unreadable checkpoint {}: {}",
                    self.store.location(),
                    e
                );
                None
            }
        }
    }

    /// Begin a run, inheriting completed files from `resume`
    pub fn start_run(&self, pending: Vec<String>, resume: Option<&RunCheckpoint>) {
        let mut checkpoint = RunCheckpoint::new(Vec::new(), epoch_now());
        if let Some(prior) = resume {
            checkpoint.completed_files = prior.completed_files.clone();
        }
        checkpoint.set_pending(pending);

        let mut inner = self.inner.lock();
        inner.checkpoint = checkpoint;
        inner.phase = RunPhase::Running;
        self.persist(&inner.checkpoint);
    }

    pub fn set_current_file(&self, path: Option<&str>) {
        let mut inner = self.inner.lock();
        inner.checkpoint.current_file = path.map(str::to_string);
        self.persist(&inner.checkpoint);
    }

    pub fn mark_completed(&self, path: &str) {
        let mut inner = self.inner.lock();
        inner.checkpoint.mark_completed(path);
        self.persist(&inner.checkpoint);
    }

    pub fn set_pending_files(&self, pending: Vec<String>) {
        let mut inner = self.inner.lock();
        inner.checkpoint.set_pending(pending);
        self.persist(&inner.checkpoint);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request();
        self.observe_shutdown();
    }

    /// Poll point between items; false once shutdown has been requested
    pub fn should_continue(&self) -> bool {
        if self.shutdown.is_requested() {
            self.observe_shutdown();
            false
        } else {
            true
        }
    }

    fn observe_shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.checkpoint.shutdown_requested {
            return;
        }
        inner.checkpoint.shutdown_requested = true;
        if inner.phase == RunPhase::Running {
            inner.phase = RunPhase::ShutdownRequested;
        }
        info!(
            "Shutdown requested - finishing current item, {} pending left for resume",
            inner.checkpoint.pending_files.len()
        );
        self.persist(&inner.checkpoint);
    }

    /// Clean completion: stop and delete the checkpoint
    pub fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.phase = RunPhase::Stopped;
        inner.checkpoint.current_file = None;
        if let Err(e) = self.store.remove() {
            warn!(
                "Failed to delete checkpoint {}: {}",
                self.store.location(),
                e
            );
        }
    }

    /// Interrupted completion: stop and keep the checkpoint for resume
    pub fn suspend(&self) {
        let mut inner = self.inner.lock();
        inner.phase = RunPhase::Stopped;
        inner.checkpoint.current_file = None;
        self.persist(&inner.checkpoint);
        info!(
            "Run suspended - checkpoint kept at {} ({} pending)",
            self.store.location(),
            inner.checkpoint.pending_files.len()
        );
    }

    pub fn phase(&self) -> RunPhase {
        self.inner.lock().phase
    }

    pub fn snapshot(&self) -> RunCheckpoint {
        self.inner.lock().checkpoint.clone()
    }

    /// Drop any persisted checkpoint without touching the in-memory state
    pub fn discard(&self) {
        if let Err(e) = self.store.remove() {
            warn!(
                "Failed to delete checkpoint {}: {}",
                self.store.location(),
                e
            );
        }
    }

    fn persist(&self, checkpoint: &RunCheckpoint) {
        if let Err(e) = self.store.save(checkpoint) {
            warn!(
                "Failed to persist checkpoint to {}: {}",
                self.store.location(),
                e
            );
        }
    }
}
