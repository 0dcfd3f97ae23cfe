/*
 * Agent Orchestration - local task-execution engine
 *
 * Given a set of candidate files: detect which changed, lock them for
 * exclusive processing, throttle outbound calls, run a worker with
 * per-item failure isolation, checkpoint progress for kill-and-resume,
 * and report aggregate metrics.
 *
 * Architecture:
 * - Change detection (BLAKE3 content hash + mtime/size fast path)
 * - Advisory resource locks (condvar / Notify waits, TTL expiry)
 * - Token-bucket throttle
 * - Checkpoint/Resume (signal flag observed between items)
 * - Priority batch queue
 * - Sequential, thread-pool and async execution over one item pipeline
 */

// Public modules
pub mod batch;
pub mod checkpoint;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod hooks;
pub mod incremental;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod priority;
pub mod shutdown;
pub mod telemetry;
pub mod throttle;
pub mod worker;

// Re-exports
pub use batch::{BatchQueue, BatchResult, BatchStats};
pub use checkpoint::{CheckpointStore, RunPhase};
pub use command::{CommandOutcome, CommandRunner, CommandStatus, CommandWorker};
pub use config::{ExecutionMode, RunnerConfig};
pub use discovery::collect_candidates;
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use fingerprint::FileFingerprint;
pub use hooks::{CompletionHook, FnHook, LoggingHook};
pub use incremental::{ChangeDetector, ChangeReason};
pub use job::{ItemState, ItemStateMachine, Priority, WorkItem};
pub use lock::{LockMode, LockOwner, ResourceLock, ResourceLockManager};
pub use metrics::{MetricsSnapshot, RunMetrics};
pub use orchestrator::{RunSettings, RunSummary, StatusReport, TaskRunner, TaskRunnerBuilder};
pub use priority::{FilePriorityManager, PriorityPolicy, UniformPriority};
pub use shutdown::ShutdownSignal;
pub use throttle::{Throttle, ThrottleState, ThrottleStats};
pub use worker::{worker_fn, AsyncWorker, BlockingWorker, SyncAdapter, WorkOutput, Worker};

#[cfg(feature = "metrics")]
pub use metrics::PrometheusExporter;
