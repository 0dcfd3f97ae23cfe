//! agent-state - Persisted run state for agent-runner
//!
//! Two documents survive between runs:
//!
//! 1. **Processing index**: which files were processed, when, and with which
//!    content hash. Drives change detection.
//! 2. **Run checkpoint**: completed/pending/current items of a run. Left on
//!    disk when a run is interrupted, deleted on clean completion.
//!
//! Both are whole-document JSON, written atomically (temp file + rename).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_state::{JsonFileStore, RunCheckpoint, StateStore};
//!
//! let store = JsonFileStore::<RunCheckpoint>::new(".agent-state/shutdown_state.json");
//! let mut cp = RunCheckpoint::new(vec!["a.py".into(), "b.py".into()], epoch_now());
//! cp.mark_completed("a.py");
//! store.save(&cp)?;
//!
//! // after a restart
//! let resumed = store.load()?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StateError};

pub use domain::{epoch_now, IndexEntry, ProcessingIndex, RunCheckpoint, StateStore};
pub use infrastructure::{JsonFileStore, MemoryStore};
