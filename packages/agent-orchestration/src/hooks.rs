use crate::orchestrator::RunSummary;
use tracing::{info, warn};

/// Called once per run, after the index and checkpoint are settled
pub trait CompletionHook: Send + Sync {
    fn on_complete(&self, summary: &RunSummary) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        "hook"
    }
}

/// Logs the run summary at `info`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

impl CompletionHook for LoggingHook {
    fn on_complete(&self, summary: &RunSummary) -> anyhow::Result<()> {
        info!(
            run_id = %summary.run_id,
            processed = summary.processed,
            successful = summary.successful,
            failed = summary.failed,
            modified = summary.modified,
            interrupted = summary.interrupted,
            "Run finished in {:.2}s ({:.1}% success, {} remaining)",
            summary.elapsed,
            summary.success_rate * 100.0,
            summary.remaining.len()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Closure-backed hook
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&RunSummary) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> CompletionHook for FnHook<F>
where
    F: Fn(&RunSummary) -> anyhow::Result<()> + Send + Sync,
{
    fn on_complete(&self, summary: &RunSummary) -> anyhow::Result<()> {
        (self.f)(summary)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Run every hook; a failing hook is logged and does not stop the others
pub(crate) fn dispatch(hooks: &[std::sync::Arc<dyn CompletionHook>], summary: &RunSummary) {
    for hook in hooks {
        if let Err(e) = hook.on_complete(summary) {
            warn!(hook = hook.name(), "Completion hook failed: {:#}", e);
        }
    }
}
