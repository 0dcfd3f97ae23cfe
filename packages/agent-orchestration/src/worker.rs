//! Worker seams
//!
//! A worker does the actual per-item processing (a subprocess, a network
//! call). Errors and panics raised by a worker never cross [`invoke`] /
//! [`invoke_async`]; they come back as `WorkerFailed` / `WorkerPanicked`.

use crate::error::{OrchestratorError, Result};
use crate::job::WorkItem;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// What one worker iteration produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    /// The iteration modified its input; another iteration may follow
    pub changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl WorkOutput {
    pub fn changed() -> Self {
        Self {
            changed: true,
            detail: None,
        }
    }

    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Blocking worker, callable from any thread
pub trait Worker: Send + Sync {
    fn process(&self, item: &WorkItem) -> anyhow::Result<WorkOutput>;

    fn name(&self) -> &str {
        "worker"
    }
}

#[async_trait]
pub trait AsyncWorker: Send + Sync {
    async fn process(&self, item: &WorkItem) -> anyhow::Result<WorkOutput>;

    fn name(&self) -> &str {
        "async-worker"
    }
}

/// Closure-backed [`Worker`]
pub struct FnWorker<F> {
    f: F,
}

pub fn worker_fn<F>(f: F) -> FnWorker<F>
where
    F: Fn(&WorkItem) -> anyhow::Result<WorkOutput> + Send + Sync,
{
    FnWorker { f }
}

impl<F> Worker for FnWorker<F>
where
    F: Fn(&WorkItem) -> anyhow::Result<WorkOutput> + Send + Sync,
{
    fn process(&self, item: &WorkItem) -> anyhow::Result<WorkOutput> {
        (self.f)(item)
    }

    fn name(&self) -> &str {
        "fn-worker"
    }
}

/// Exposes a blocking [`Worker`] as an [`AsyncWorker`]
///
/// The wrapped worker runs inline on the executor thread.
pub struct SyncAdapter<'a> {
    inner: &'a dyn Worker,
}

impl<'a> SyncAdapter<'a> {
    pub fn new(inner: &'a dyn Worker) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<'a> AsyncWorker for SyncAdapter<'a> {
    async fn process(&self, item: &WorkItem) -> anyhow::Result<WorkOutput> {
        self.inner.process(item)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Exposes an [`AsyncWorker`] as a blocking [`Worker`]
///
/// Owns a one-thread tokio runtime; concurrent callers each `block_on` it.
/// Callers already inside a runtime block on a scoped thread instead.
pub struct BlockingWorker<W> {
    inner: W,
    runtime: tokio::runtime::Runtime,
}

impl<W: AsyncWorker> BlockingWorker<W> {
    pub fn new(inner: W) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("agent-blocking-worker")
            .enable_all()
            .build()?;
        Ok(Self { inner, runtime })
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }
}

impl<W: AsyncWorker> Worker for BlockingWorker<W> {
    fn process(&self, item: &WorkItem) -> anyhow::Result<WorkOutput> {
        if tokio::runtime::Handle::try_current().is_err() {
            return self.runtime.block_on(self.inner.process(item));
        }
        // Already on a runtime thread (async mode): block_on here would panic
        std::thread::scope(|scope| {
            scope
                .spawn(|| self.runtime.block_on(self.inner.process(item)))
                .join()
                .unwrap_or_else(|payload| panic::resume_unwind(payload))
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn worker_error(e: anyhow::Error) -> OrchestratorError {
    OrchestratorError::WorkerFailed(format!("{:#}", e))
}

/// Run one worker call, converting errors and panics into `Err`
pub fn invoke(worker: &dyn Worker, item: &WorkItem) -> Result<WorkOutput> {
    match panic::catch_unwind(AssertUnwindSafe(|| worker.process(item))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(worker_error(e)),
        Err(payload) => Err(OrchestratorError::WorkerPanicked(panic_message(
            payload.as_ref(),
        ))),
    }
}

pub async fn invoke_async(worker: &dyn AsyncWorker, item: &WorkItem) -> Result<WorkOutput> {
    match AssertUnwindSafe(worker.process(item)).catch_unwind().await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(worker_error(e)),
        Err(payload) => Err(OrchestratorError::WorkerPanicked(panic_message(
            payload.as_ref(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Priority;

    struct Doubler;

    #[async_trait]
    impl AsyncWorker for Doubler {
        async fn process(&self, item: &WorkItem) -> anyhow::Result<WorkOutput> {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            Ok(WorkOutput::unchanged().with_detail(serde_json::json!(item.priority * 2)))
        }
    }

    #[test]
    fn test_invoke_converts_errors() {
        let worker = worker_fn(|item| anyhow::bail!("cannot handle {}", item.identity));
        let err = invoke(&worker, &WorkItem::new("x.py", Priority::Low)).unwrap_err();
        match err {
            OrchestratorError::WorkerFailed(msg) => assert_eq!(msg, "cannot handle x.py"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_invoke_catches_panics() {
        let worker = worker_fn(|_| panic!("boom"));
        let err = invoke(&worker, &WorkItem::new("x.py", Priority::Low)).unwrap_err();
        match err {
            OrchestratorError::WorkerPanicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_blocking_worker_drives_async_worker() {
        let worker = BlockingWorker::new(Doubler).unwrap();
        let out = invoke(&worker, &WorkItem::new("x.py", Priority::High)).unwrap();
        assert_eq!(out.detail, Some(serde_json::json!(4)));
    }

    #[tokio::test]
    async fn test_blocking_worker_inside_runtime() {
        let worker = BlockingWorker::new(Doubler).unwrap();
        let out = invoke(&worker, &WorkItem::new("x.py", Priority::High)).unwrap();
        assert_eq!(out.detail, Some(serde_json::json!(4)));
    }

    #[tokio::test]
    async fn test_blocking_worker_panic_inside_runtime() {
        struct Exploder;

        #[async_trait]
        impl AsyncWorker for Exploder {
            async fn process(&self, _item: &WorkItem) -> anyhow::Result<WorkOutput> {
                panic!("nested boom")
            }
        }

        let worker = BlockingWorker::new(Exploder).unwrap();
        let err = invoke(&worker, &WorkItem::new("x.py", Priority::Low)).unwrap_err();
        match err {
            OrchestratorError::WorkerPanicked(msg) => assert_eq!(msg, "nested boom"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_adapter() {
        let worker = worker_fn(|_| Ok(WorkOutput::changed()));
        let adapter = SyncAdapter::new(&worker);
        let out = invoke_async(&adapter, &WorkItem::new("x.py", Priority::Low))
            .await
            .unwrap();
        assert!(out.changed);
    }

    #[tokio::test]
    async fn test_invoke_async_catches_panics() {
        let worker = worker_fn(|_| panic!("async boom"));
        let adapter = SyncAdapter::new(&worker);
        let err = invoke_async(&adapter, &WorkItem::new("x.py", Priority::Low))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkerPanicked(_)));
    }
}
