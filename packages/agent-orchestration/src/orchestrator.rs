//! TaskRunner: the driver loop
//!
//! changed files -> priority order -> per item: lock, throttle, worker
//! iterations until convergence, release, fingerprint + checkpoint.
//! Failed items keep their old fingerprint and are picked up next run.

use crate::batch::{BatchQueue, BatchResult, BatchStats};
use crate::checkpoint::CheckpointStore;
use crate::config::{ExecutionMode, RunnerConfig};
use crate::error::{OrchestratorError, Result};
use crate::hooks::{self, CompletionHook};
use crate::incremental::{ChangeDetector, ChangeReason};
use crate::job::{ItemStateMachine, Priority, WorkItem};
use crate::lock::{LockMode, LockOwner, ResourceLock, ResourceLockManager};
use crate::metrics::{MetricsSnapshot, RunMetrics};
use crate::priority::PriorityPolicy;
use crate::shutdown::ShutdownSignal;
use crate::throttle::{Throttle, ThrottleStats};
use crate::worker::{invoke, invoke_async, AsyncWorker, SyncAdapter, WorkOutput, Worker};
use agent_state::RunCheckpoint;
use futures::StreamExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregate outcome of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    /// Successful items whose worker reported a change
    pub modified: usize,
    pub success_rate: f64,
    pub avg_time: f64,
    pub total_time: f64,
    /// Wall-clock seconds for the whole run
    pub elapsed: f64,
    /// Stopped early on a shutdown request
    pub interrupted: bool,
    /// Planned items that were never attempted
    pub remaining: Vec<String>,
    #[serde(default)]
    pub results: Vec<BatchResult>,
    #[serde(default)]
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        !self.interrupted
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &BatchResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Scheduling and bounds for a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub batch_size: usize,
    pub max_iterations: u32,
    pub mode: ExecutionMode,
    pub workers: usize,
    pub async_concurrency: usize,
    pub lock_timeout: Duration,
    pub throttle_timeout: Option<Duration>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

impl RunSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            batch_size: config.batch.batch_size.max(1),
            max_iterations: config.batch.max_iterations.max(1),
            mode: config.batch.mode,
            workers: config.batch.workers.max(1),
            async_concurrency: config.batch.async_concurrency.max(1),
            lock_timeout: config.lock.timeout(),
            throttle_timeout: config.throttle.timeout(),
        }
    }
}

/// State directory summary for `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub tracked_files: usize,
    pub last_run_timestamp: f64,
    pub resumable: Option<RunCheckpoint>,
}

/// Releases the item's lock on every exit path
struct HeldLock<'a> {
    manager: &'a ResourceLockManager,
    resource: &'a str,
    owner: &'a LockOwner,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        self.manager.release_as(self.resource, self.owner);
    }
}

/// Per-run bookkeeping shared by all items
struct RunContext {
    run_id: String,
    started: Instant,
    planned: Vec<String>,
    queue: BatchQueue,
    stopped: AtomicBool,
}

struct ItemOutcome {
    modified: bool,
    iterations: u32,
    detail: Option<serde_json::Value>,
}

pub struct TaskRunner {
    detector: Arc<ChangeDetector>,
    checkpoint: Arc<CheckpointStore>,
    locks: Option<Arc<ResourceLockManager>>,
    throttle: Option<Arc<Throttle>>,
    priority: Option<Arc<dyn PriorityPolicy>>,
    hooks: Vec<Arc<dyn CompletionHook>>,
    metrics: Arc<RunMetrics>,
    settings: RunSettings,
}

impl TaskRunner {
    pub fn builder() -> TaskRunnerBuilder {
        TaskRunnerBuilder::default()
    }

    /// JSON-backed runner rooted at `config.state_dir`
    ///
    /// Failing to create the state directory is fatal.
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.state_dir).map_err(|e| {
            OrchestratorError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "cannot create state directory {}: {}",
                    config.state_dir.display(),
                    e
                ),
            ))
        })?;

        let mut builder = Self::builder()
            .settings(RunSettings::from_config(config))
            .change_detector(Arc::new(ChangeDetector::open(config.index_path())))
            .checkpoint_store(Arc::new(CheckpointStore::open(
                config.checkpoint_path(),
                ShutdownSignal::new(),
            )))
            .priority_policy(Arc::new(config.priority.build()?));

        if config.lock.enabled {
            builder = builder.lock_manager(Arc::new(ResourceLockManager::new(
                config.lock.timeout(),
                config.lock.ttl(),
            )));
        }
        if config.throttle.enabled {
            builder = builder.throttle(Arc::new(Throttle::new(
                config.throttle.requests_per_second,
                config.throttle.burst_size,
            )));
        }

        info!(
            "Runner state in {} (mode: {}, batch size: {})",
            config.state_dir.display(),
            config.batch.mode,
            config.batch.batch_size
        );
        Ok(builder.build())
    }

    pub fn add_hook(&mut self, hook: Arc<dyn CompletionHook>) {
        self.hooks.push(hook);
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn change_detector(&self) -> &Arc<ChangeDetector> {
        &self.detector
    }

    pub fn checkpoint_store(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        self.checkpoint.shutdown_signal()
    }

    pub fn metrics(&self) -> &Arc<RunMetrics> {
        &self.metrics
    }

    // ═══════════════════════════════════════════════════════════════
    // Collaborator surface
    // ═══════════════════════════════════════════════════════════════

    pub fn get_changed_files(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        self.detector.get_changed(paths)
    }

    pub fn mark_processed(&self, path: &Path) -> bool {
        self.detector.mark_processed(path)
    }

    /// Forget all fingerprints and any resumable checkpoint
    pub fn reset_state(&self) {
        self.detector.reset();
        self.checkpoint.discard();
        info!("Runner state reset - next run reprocesses everything");
    }

    /// `None` on timeout or when no lock manager is configured
    pub fn acquire_lock(
        &self,
        path: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Option<ResourceLock> {
        self.locks.as_ref()?.acquire(path, mode, timeout)
    }

    pub fn release_lock(&self, path: &str) -> bool {
        self.locks.as_ref().is_some_and(|l| l.release(path))
    }

    /// Always admitted when no throttle is configured
    pub fn acquire_token(&self, timeout: Option<Duration>) -> bool {
        self.throttle.as_ref().map_or(true, |t| t.acquire(timeout))
    }

    pub fn get_rate_stats(&self) -> Option<ThrottleStats> {
        self.throttle.as_ref().map(|t| t.get_stats())
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            tracked_files: self.detector.tracked_files(),
            last_run_timestamp: self.detector.last_run_timestamp(),
            resumable: self.checkpoint.load_resume_state(),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Runs
    // ═══════════════════════════════════════════════════════════════

    /// Run `worker` over the changed subset of `candidates`
    ///
    /// In async mode this drives [`run_async`](Self::run_async) on a private
    /// current-thread runtime, so it must not be called from inside one.
    pub fn run(&self, candidates: &[PathBuf], worker: &dyn Worker) -> Result<RunSummary> {
        match self.settings.mode {
            ExecutionMode::Sequential => self.run_blocking(candidates, worker, None),
            ExecutionMode::ThreadPool => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(self.settings.workers)
                    .thread_name(|i| format!("agent-worker-{}", i))
                    .build()
                    .map_err(|e| OrchestratorError::config(format!("thread pool: {}", e)))?;
                self.run_blocking(candidates, worker, Some(&pool))
            }
            ExecutionMode::Async => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(self.run_async(candidates, &SyncAdapter::new(worker)))
            }
        }
    }

    fn run_blocking(
        &self,
        candidates: &[PathBuf],
        worker: &dyn Worker,
        pool: Option<&rayon::ThreadPool>,
    ) -> Result<RunSummary> {
        let ctx = self.prepare(candidates);
        let mut results = Vec::new();

        while !ctx.stopped.load(Ordering::SeqCst) {
            let batch = ctx.queue.drain_batch(self.settings.batch_size);
            if batch.is_empty() {
                break;
            }
            debug!(run_id = %ctx.run_id, size = batch.len(), "batch drained");

            match pool {
                None => {
                    for item in batch {
                        if !self.admit_next(&ctx) {
                            break;
                        }
                        results.push(self.process_item(&ctx, item, worker));
                    }
                }
                Some(pool) => {
                    let batch_results: Vec<Option<BatchResult>> = pool.install(|| {
                        batch
                            .into_par_iter()
                            .map(|item| {
                                self.admit_next(&ctx)
                                    .then(|| self.process_item(&ctx, item, worker))
                            })
                            .collect()
                    });
                    results.extend(batch_results.into_iter().flatten());
                }
            }
        }

        Ok(self.conclude(ctx, results))
    }

    /// Async variant; lock and throttle waits suspend instead of blocking
    pub async fn run_async(
        &self,
        candidates: &[PathBuf],
        worker: &dyn AsyncWorker,
    ) -> Result<RunSummary> {
        let ctx = self.prepare(candidates);
        let mut results = Vec::new();

        while !ctx.stopped.load(Ordering::SeqCst) {
            let batch = ctx.queue.drain_batch(self.settings.batch_size);
            if batch.is_empty() {
                break;
            }
            debug!(run_id = %ctx.run_id, size = batch.len(), "batch drained");

            let ctx_ref = &ctx;
            let batch_results: Vec<Option<BatchResult>> = futures::stream::iter(batch)
                .map(|item| async move {
                    if self.admit_next(ctx_ref) {
                        Some(self.process_item_async(ctx_ref, item, worker).await)
                    } else {
                        None
                    }
                })
                .buffered(self.settings.async_concurrency)
                .collect()
                .await;
            results.extend(batch_results.into_iter().flatten());
        }

        Ok(self.conclude(ctx, results))
    }

    fn prepare(&self, candidates: &[PathBuf]) -> RunContext {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        self.metrics.reset();

        let resume = self.checkpoint.load_resume_state();
        let completed: HashSet<&str> = resume
            .as_ref()
            .map(|cp| cp.completed_files.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let changed = self.detector.get_changed(candidates);
        let queue = BatchQueue::new(self.settings.batch_size);
        let mut skipped = 0usize;
        for path in &changed {
            let identity = path.to_string_lossy();
            // Edited after it completed: the checkpoint entry is stale
            if completed.contains(identity.as_ref())
                && self.detector.check(path) != ChangeReason::ContentChanged
            {
                skipped += 1;
                continue;
            }
            let priority = self
                .priority
                .as_ref()
                .map_or(Priority::Normal, |p| p.priority_of(path));
            queue.add(WorkItem::for_path(path, priority));
        }

        // Queue order after the stable priority sort
        let ordered = queue.drain_batch(usize::MAX);
        let planned: Vec<String> = ordered.iter().map(|i| i.identity.clone()).collect();
        queue.extend(ordered);

        self.checkpoint.start_run(planned.clone(), resume.as_ref());
        let pending: Vec<PathBuf> = planned.iter().map(PathBuf::from).collect();
        self.detector.set_pending(&pending);

        info!(
            run_id = %run_id,
            "Run started: {} candidates, {} changed, {} planned{}",
            candidates.len(),
            changed.len(),
            planned.len(),
            if skipped > 0 {
                format!(", {} already completed before interruption", skipped)
            } else {
                String::new()
            }
        );

        RunContext {
            run_id,
            started,
            planned,
            queue,
            stopped: AtomicBool::new(false),
        }
    }

    /// Shutdown poll point between items
    fn admit_next(&self, ctx: &RunContext) -> bool {
        if ctx.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if self.checkpoint.should_continue() {
            true
        } else {
            ctx.stopped.store(true, Ordering::SeqCst);
            false
        }
    }

    fn lock_owner(ctx: &RunContext, item: &WorkItem) -> LockOwner {
        LockOwner::new(format!("run:{}/item:{}", ctx.run_id, item.seq))
    }

    fn process_item(&self, ctx: &RunContext, item: WorkItem, worker: &dyn Worker) -> BatchResult {
        let start = Instant::now();
        let owner = Self::lock_owner(ctx, &item);
        let mut sm = ItemStateMachine::new(item);
        self.checkpoint.set_current_file(Some(&sm.item().identity));

        let outcome = self.execute_item(&mut sm, &owner, worker);
        self.finish_item(sm, outcome, start)
    }

    fn execute_item(
        &self,
        sm: &mut ItemStateMachine,
        owner: &LockOwner,
        worker: &dyn Worker,
    ) -> Result<ItemOutcome> {
        let identity = sm.item().identity.clone();

        sm.begin_locking()?;
        let _held = match &self.locks {
            Some(locks) => {
                locks
                    .acquire_as(&identity, LockMode::Exclusive, self.settings.lock_timeout, owner)
                    .ok_or_else(|| OrchestratorError::LockTimeout(identity.clone()))?;
                Some(HeldLock {
                    manager: locks,
                    resource: &identity,
                    owner,
                })
            }
            None => None,
        };
        sm.lock_acquired()?;

        self.admit_throttle()?;
        sm.admitted()?;

        let mut outcome = ItemOutcome {
            modified: false,
            iterations: 0,
            detail: None,
        };
        loop {
            outcome.iterations = sm.next_iteration()?;
            if outcome.iterations > 1 {
                self.admit_throttle()?;
            }
            self.metrics.record_iteration();

            let output = invoke(worker, sm.item())?;
            if !self.absorb(&mut outcome, output, &identity) {
                break;
            }
        }

        sm.complete(outcome.modified)?;
        Ok(outcome)
    }

    async fn process_item_async(
        &self,
        ctx: &RunContext,
        item: WorkItem,
        worker: &dyn AsyncWorker,
    ) -> BatchResult {
        let start = Instant::now();
        let owner = Self::lock_owner(ctx, &item);
        let mut sm = ItemStateMachine::new(item);
        self.checkpoint.set_current_file(Some(&sm.item().identity));

        let outcome = self.execute_item_async(&mut sm, &owner, worker).await;
        self.finish_item(sm, outcome, start)
    }

    async fn execute_item_async(
        &self,
        sm: &mut ItemStateMachine,
        owner: &LockOwner,
        worker: &dyn AsyncWorker,
    ) -> Result<ItemOutcome> {
        let identity = sm.item().identity.clone();

        sm.begin_locking()?;
        let _held = match &self.locks {
            Some(locks) => {
                locks
                    .acquire_async_as(
                        &identity,
                        LockMode::Exclusive,
                        self.settings.lock_timeout,
                        owner,
                    )
                    .await
                    .ok_or_else(|| OrchestratorError::LockTimeout(identity.clone()))?;
                Some(HeldLock {
                    manager: locks,
                    resource: &identity,
                    owner,
                })
            }
            None => None,
        };
        sm.lock_acquired()?;

        self.admit_throttle_async().await?;
        sm.admitted()?;

        let mut outcome = ItemOutcome {
            modified: false,
            iterations: 0,
            detail: None,
        };
        loop {
            outcome.iterations = sm.next_iteration()?;
            if outcome.iterations > 1 {
                self.admit_throttle_async().await?;
            }
            self.metrics.record_iteration();

            let output = invoke_async(worker, sm.item()).await?;
            if !self.absorb(&mut outcome, output, &identity) {
                break;
            }
        }

        sm.complete(outcome.modified)?;
        Ok(outcome)
    }

    /// Fold one iteration into `outcome`; true if another iteration should run
    fn absorb(&self, outcome: &mut ItemOutcome, output: WorkOutput, identity: &str) -> bool {
        outcome.modified |= output.changed;
        outcome.detail = output.detail;
        if !output.changed {
            return false;
        }
        if outcome.iterations >= self.settings.max_iterations {
            debug!(
                item = identity,
                iterations = outcome.iterations,
                "iteration limit reached before convergence"
            );
            return false;
        }
        true
    }

    fn throttle_timeout_error(&self) -> OrchestratorError {
        let ms = self
            .settings
            .throttle_timeout
            .map_or(0, |d| d.as_millis() as u64);
        OrchestratorError::ThrottleTimeout(ms)
    }

    fn admit_throttle(&self) -> Result<()> {
        match &self.throttle {
            Some(t) if !t.acquire(self.settings.throttle_timeout) => {
                Err(self.throttle_timeout_error())
            }
            _ => Ok(()),
        }
    }

    async fn admit_throttle_async(&self) -> Result<()> {
        if let Some(t) = &self.throttle {
            if !t.acquire_async(self.settings.throttle_timeout).await {
                return Err(self.throttle_timeout_error());
            }
        }
        Ok(())
    }

    fn finish_item(
        &self,
        mut sm: ItemStateMachine,
        outcome: Result<ItemOutcome>,
        start: Instant,
    ) -> BatchResult {
        let identity = sm.item().identity.clone();
        let secs = start.elapsed().as_secs_f64();

        match outcome {
            Ok(done) => {
                self.detector.mark_processed(sm.item().path());
                self.checkpoint.mark_completed(&identity);
                if let Err(e) = sm.checkpointed() {
                    debug!(item = %identity, "state machine: {}", e);
                }
                self.metrics.record_success(done.modified);
                info!(
                    item = %identity,
                    attempt = sm.item().attempts,
                    iterations = done.iterations,
                    modified = done.modified,
                    elapsed = secs,
                    "item completed"
                );
                let output = WorkOutput {
                    changed: done.modified,
                    detail: done.detail,
                };
                BatchResult::succeeded(identity, output, secs)
            }
            Err(e) => {
                match &e {
                    OrchestratorError::LockTimeout(_) => self.metrics.record_lock_timeout(),
                    OrchestratorError::ThrottleTimeout(_) => {
                        self.metrics.record_throttle_timeout()
                    }
                    OrchestratorError::WorkerPanicked(_) => self.metrics.record_panic(),
                    _ => {}
                }
                self.metrics.record_failure();

                let category = e.category();
                warn!(
                    item = %identity,
                    category = %category,
                    elapsed = secs,
                    "item failed: {}",
                    e
                );
                if let Err(sm_err) = sm.fail(e.to_string(), category) {
                    debug!(item = %identity, "state machine: {}", sm_err);
                }
                BatchResult::failed(identity, e.to_string(), secs)
            }
        }
    }

    fn conclude(&self, ctx: RunContext, results: Vec<BatchResult>) -> RunSummary {
        let interrupted = ctx.stopped.load(Ordering::SeqCst);
        self.detector.complete_run();
        if interrupted {
            // Completed paths are filtered out; failed items stay pending
            self.checkpoint.set_pending_files(ctx.planned.clone());
            self.checkpoint.suspend();
        } else {
            self.checkpoint.finish();
        }
        // The request is consumed by this run; the next one starts fresh
        self.checkpoint.shutdown_signal().reset();

        let attempted: HashSet<&str> = results.iter().map(|r| r.identity.as_str()).collect();
        let remaining: Vec<String> = ctx
            .planned
            .iter()
            .filter(|id| !attempted.contains(id.as_str()))
            .cloned()
            .collect();

        let stats = BatchStats::from_results(&results);
        let snapshot = self.metrics.snapshot();
        let summary = RunSummary {
            run_id: ctx.run_id,
            processed: stats.processed,
            successful: stats.successful,
            failed: stats.failed,
            modified: snapshot.modified as usize,
            success_rate: stats.success_rate,
            avg_time: stats.avg_time,
            total_time: stats.total_time,
            elapsed: ctx.started.elapsed().as_secs_f64(),
            interrupted,
            remaining,
            results,
            metrics: snapshot,
        };

        if interrupted {
            warn!(
                run_id = %summary.run_id,
                "Run interrupted: {} items left for resume",
                summary.remaining.len()
            );
        }
        hooks::dispatch(&self.hooks, &summary);
        summary
    }
}

/// Explicit composition; absent optional components stay absent
#[derive(Default)]
pub struct TaskRunnerBuilder {
    detector: Option<Arc<ChangeDetector>>,
    checkpoint: Option<Arc<CheckpointStore>>,
    locks: Option<Arc<ResourceLockManager>>,
    throttle: Option<Arc<Throttle>>,
    priority: Option<Arc<dyn PriorityPolicy>>,
    hooks: Vec<Arc<dyn CompletionHook>>,
    metrics: Option<Arc<RunMetrics>>,
    settings: Option<RunSettings>,
}

impl TaskRunnerBuilder {
    pub fn change_detector(mut self, detector: Arc<ChangeDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn checkpoint_store(mut self, checkpoint: Arc<CheckpointStore>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn lock_manager(mut self, locks: Arc<ResourceLockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn priority_policy(mut self, policy: Arc<dyn PriorityPolicy>) -> Self {
        self.priority = Some(policy);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn CompletionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    fn settings_mut(&mut self) -> &mut RunSettings {
        self.settings.get_or_insert_with(RunSettings::default)
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.settings_mut().batch_size = batch_size.max(1);
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.settings_mut().max_iterations = max_iterations.max(1);
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.settings_mut().mode = mode;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.settings_mut().workers = workers.max(1);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.settings_mut().lock_timeout = timeout;
        self
    }

    pub fn throttle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings_mut().throttle_timeout = timeout;
        self
    }

    /// Missing detector and checkpoint default to in-memory stores
    pub fn build(self) -> TaskRunner {
        TaskRunner {
            detector: self
                .detector
                .unwrap_or_else(|| Arc::new(ChangeDetector::in_memory())),
            checkpoint: self
                .checkpoint
                .unwrap_or_else(|| Arc::new(CheckpointStore::in_memory())),
            locks: self.locks,
            throttle: self.throttle,
            priority: self.priority,
            hooks: self.hooks,
            metrics: self.metrics.unwrap_or_default(),
            settings: self.settings.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::worker::worker_fn;
    use agent_state::MemoryStore;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn files(dir: &TempDir, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let p = dir.path().join(format!("f{}.py", i));
                fs::write(&p, format!("content {}", i)).unwrap();
                p
            })
            .collect()
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let paths = files(&dir, 4);
        let runner = TaskRunner::builder().build();
        let worker = worker_fn(|_| Ok(WorkOutput::unchanged()));

        let first = runner.run(&paths, &worker).unwrap();
        assert_eq!(first.processed, 4);
        assert!(first.is_complete());

        let second = runner.run(&paths, &worker).unwrap();
        assert_eq!(second.processed, 0);
        assert!(runner.get_changed_files(&paths).is_empty());
    }

    #[test]
    fn test_iterations_stop_on_convergence() {
        let dir = TempDir::new().unwrap();
        let paths = files(&dir, 1);
        let calls = AtomicUsize::new(0);
        let worker = worker_fn(|_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(WorkOutput {
                changed: n < 1,
                detail: None,
            })
        });
        let runner = TaskRunner::builder().max_iterations(5).build();

        let summary = runner.run(&paths, &worker).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.metrics.iterations, 2);
    }

    #[test]
    fn test_iterations_bounded_for_non_converging_worker() {
        let dir = TempDir::new().unwrap();
        let paths = files(&dir, 1);
        let calls = AtomicUsize::new(0);
        let worker = worker_fn(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(WorkOutput::changed())
        });
        let runner = TaskRunner::builder().max_iterations(3).build();

        let summary = runner.run(&paths, &worker).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.successful, 1);
    }

    #[test]
    fn test_lock_timeout_fails_item_without_fingerprint() {
        let dir = TempDir::new().unwrap();
        let paths = files(&dir, 2);
        let locks = Arc::new(ResourceLockManager::new(
            Duration::from_millis(50),
            Duration::from_secs(60),
        ));
        let blocked = paths[0].to_string_lossy().into_owned();
        let outsider = LockOwner::new("outsider");
        assert!(locks
            .try_acquire_as(&blocked, LockMode::Exclusive, &outsider)
            .is_some());

        let runner = TaskRunner::builder()
            .lock_manager(Arc::clone(&locks))
            .lock_timeout(Duration::from_millis(50))
            .build();
        let worker = worker_fn(|_| Ok(WorkOutput::unchanged()));

        let summary = runner.run(&paths, &worker).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.metrics.lock_timeouts, 1);
        let failure = summary.failed_items().next().unwrap();
        assert_eq!(failure.identity, blocked);
        assert!(failure.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(runner.get_changed_files(&paths), vec![paths[0].clone()]);

        // The runner released its own lock on the other file
        assert!(!locks.is_locked(&paths[1].to_string_lossy()));
    }

    #[test]
    fn test_throttle_timeout_fails_item() {
        let dir = TempDir::new().unwrap();
        let paths = files(&dir, 2);
        let runner = TaskRunner::builder()
            .throttle(Arc::new(Throttle::new(0.01, 1)))
            .throttle_timeout(Some(Duration::from_millis(20)))
            .build();
        let worker = worker_fn(|_| Ok(WorkOutput::unchanged()));

        let summary = runner.run(&paths, &worker).unwrap();
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.metrics.throttle_timeouts, 1);
    }

    #[test]
    fn test_shutdown_stops_between_items() {
        let dir = TempDir::new().unwrap();
        let paths = files(&dir, 5);
        let runner = TaskRunner::builder().batch_size(2).build();
        let signal = runner.shutdown_signal().clone();
        let seen = Mutex::new(Vec::new());
        let worker = worker_fn(|item| {
            let mut seen = seen.lock().unwrap();
            seen.push(item.identity.clone());
            if seen.len() == 2 {
                signal.request();
            }
            Ok(WorkOutput::unchanged())
        });

        let summary = runner.run(&paths, &worker).unwrap();
        assert!(summary.interrupted);
        assert!(!summary.is_complete());
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.remaining.len(), 3);

        let checkpoint = runner.checkpoint_store().snapshot();
        assert!(checkpoint.shutdown_requested);
        assert_eq!(checkpoint.completed_files.len(), 2);
        assert_eq!(checkpoint.pending_files.len(), 3);
    }

    #[test]
    fn test_runner_recovers_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let paths = files(&dir, 4);
        let runner = TaskRunner::builder().build();
        let signal = runner.shutdown_signal().clone();
        let calls = AtomicUsize::new(0);
        let worker = worker_fn(|_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                signal.request();
            }
            Ok(WorkOutput::unchanged())
        });

        let first = runner.run(&paths, &worker).unwrap();
        assert!(first.interrupted);
        assert_eq!(first.processed, 1);
        assert_eq!(first.remaining.len(), 3);
        assert_eq!(runner.checkpoint_store().snapshot().pending_files, first.remaining);
        assert!(!signal.is_requested());

        let second = runner.run(&paths, &worker).unwrap();
        assert!(!second.interrupted);
        assert!(second.is_complete());
        assert_eq!(second.processed, 3);
        assert!(runner.get_changed_files(&paths).is_empty());
    }

    #[test]
    fn test_resume_reprocesses_completed_file_edited_since() {
        let dir = TempDir::new().unwrap();
        let paths = files(&dir, 2);
        let ids: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        let mut prior = RunCheckpoint::new(ids.clone(), 1.0);
        prior.mark_completed(&ids[0]);
        prior.mark_completed(&ids[1]);
        let checkpoint = CheckpointStore::new(
            Arc::new(MemoryStore::with_document(&prior).unwrap()),
            ShutdownSignal::new(),
        );
        let runner = TaskRunner::builder()
            .checkpoint_store(Arc::new(checkpoint))
            .build();

        // f0 was recorded by the interrupted run, then edited
        assert!(runner.mark_processed(&paths[0]));
        fs::write(&paths[0], "edited after the interrupted run").unwrap();

        let seen = Mutex::new(Vec::new());
        let worker = worker_fn(|item| {
            seen.lock().unwrap().push(item.identity.clone());
            Ok(WorkOutput::unchanged())
        });
        let summary = runner.run(&paths, &worker).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(*seen.lock().unwrap(), vec![ids[0].clone()]);
    }

    #[test]
    fn test_helpers_without_optional_components() {
        let runner = TaskRunner::builder().build();
        assert!(runner.acquire_token(None));
        assert!(runner.get_rate_stats().is_none());
        assert!(runner.acquire_lock("a", LockMode::Exclusive, None).is_none());
        assert!(!runner.release_lock("a"));
    }

    #[test]
    fn test_helpers_delegate() {
        let runner = TaskRunner::builder()
            .lock_manager(Arc::new(ResourceLockManager::default()))
            .throttle(Arc::new(Throttle::new(100.0, 2)))
            .build();
        assert!(runner.acquire_lock("a", LockMode::Exclusive, None).is_some());
        assert!(runner.release_lock("a"));
        assert!(runner.acquire_token(Some(Duration::from_millis(10))));
        assert_eq!(runner.get_rate_stats().unwrap().requests_last_minute, 1);
    }

    #[test]
    fn test_from_config_fails_on_unusable_state_dir() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let config = RunnerConfig {
            state_dir: blocker.join("state"),
            ..RunnerConfig::default()
        };
        let err = TaskRunner::from_config(&config).err().unwrap();
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
    }
}
