use crate::error::{ErrorCategory, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Processing priority for a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(OrchestratorError::parse(format!("Invalid priority: {}", s))),
        }
    }

    /// Numeric rank used by [`WorkItem::priority`]
    pub fn value(&self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of work handed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub identity: String,
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub attempts: u32,
    /// Insertion order, assigned by the queue
    #[serde(default)]
    pub seq: u64,
}

impl WorkItem {
    pub fn new(identity: impl Into<String>, priority: Priority) -> Self {
        Self::with_rank(identity, priority.value())
    }

    pub fn with_rank(identity: impl Into<String>, priority: i32) -> Self {
        Self {
            identity: identity.into(),
            priority,
            payload: serde_json::Value::Null,
            attempts: 0,
            seq: 0,
        }
    }

    pub fn for_path(path: &Path, priority: Priority) -> Self {
        Self::new(path.to_string_lossy().into_owned(), priority)
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.identity)
    }
}

/// Capped exponential backoff: `min(2^attempt, cap)` seconds
pub fn retry_backoff(attempt: u32, cap: Duration) -> Duration {
    let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

/// Per-item pipeline state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemState {
    Pending {
        queued_at: DateTime<Utc>,
    },
    Locking {
        started_at: DateTime<Utc>,
    },
    Throttled {
        started_at: DateTime<Utc>,
        locked_at: DateTime<Utc>,
    },
    Executing {
        started_at: DateTime<Utc>,
        iteration: u32,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        iterations: u32,
        modified: bool,
    },
    Checkpointed {
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        iterations: u32,
        modified: bool,
    },
    Failed {
        failed_at: DateTime<Utc>,
        failed_in: String,
        error: String,
        error_category: ErrorCategory,
    },
}

impl ItemState {
    pub fn state_name(&self) -> &'static str {
        match self {
            ItemState::Pending { .. } => "pending",
            ItemState::Locking { .. } => "locking",
            ItemState::Throttled { .. } => "throttled",
            ItemState::Executing { .. } => "executing",
            ItemState::Completed { .. } => "completed",
            ItemState::Checkpointed { .. } => "checkpointed",
            ItemState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Checkpointed { .. } | ItemState::Failed { .. })
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ItemState::Locking { started_at }
            | ItemState::Throttled { started_at, .. }
            | ItemState::Executing { started_at, .. }
            | ItemState::Completed { started_at, .. } => Some(*started_at),
            _ => None,
        }
    }
}

/// Item state machine for transitions
///
/// `Pending -> Locking -> Throttled -> Executing -> Completed -> Checkpointed`,
/// with `Failed` reachable from any non-terminal state.
pub struct ItemStateMachine {
    item: WorkItem,
    state: ItemState,
}

impl ItemStateMachine {
    pub fn new(item: WorkItem) -> Self {
        Self {
            item,
            state: ItemState::Pending {
                queued_at: Utc::now(),
            },
        }
    }

    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn state(&self) -> &ItemState {
        &self.state
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    /// Transition: PENDING → LOCKING
    pub fn begin_locking(&mut self) -> Result<()> {
        match &self.state {
            ItemState::Pending { .. } => {
                self.state = ItemState::Locking {
                    started_at: Utc::now(),
                };
                Ok(())
            }
            _ => Err(self.invalid("locking")),
        }
    }

    /// Transition: LOCKING → THROTTLED
    pub fn lock_acquired(&mut self) -> Result<()> {
        match &self.state {
            ItemState::Locking { started_at } => {
                self.state = ItemState::Throttled {
                    started_at: *started_at,
                    locked_at: Utc::now(),
                };
                Ok(())
            }
            _ => Err(self.invalid("throttled")),
        }
    }

    /// Transition: THROTTLED → EXECUTING
    pub fn admitted(&mut self) -> Result<()> {
        match &self.state {
            ItemState::Throttled { started_at, .. } => {
                self.state = ItemState::Executing {
                    started_at: *started_at,
                    iteration: 0,
                };
                self.item.attempts += 1;
                Ok(())
            }
            _ => Err(self.invalid("executing")),
        }
    }

    /// Record a worker iteration; returns the new iteration count
    pub fn next_iteration(&mut self) -> Result<u32> {
        match &mut self.state {
            ItemState::Executing { iteration, .. } => {
                *iteration += 1;
                Ok(*iteration)
            }
            _ => Err(self.invalid("executing (iteration)")),
        }
    }

    /// Transition: EXECUTING → COMPLETED
    pub fn complete(&mut self, modified: bool) -> Result<()> {
        match &self.state {
            ItemState::Executing {
                started_at,
                iteration,
            } => {
                let now = Utc::now();
                self.state = ItemState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                    duration_ms: (now - *started_at).num_milliseconds().max(0) as u64,
                    iterations: *iteration,
                    modified,
                };
                Ok(())
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// Transition: COMPLETED → CHECKPOINTED
    pub fn checkpointed(&mut self) -> Result<()> {
        match &self.state {
            ItemState::Completed {
                completed_at,
                duration_ms,
                iterations,
                modified,
                ..
            } => {
                self.state = ItemState::Checkpointed {
                    completed_at: *completed_at,
                    duration_ms: *duration_ms,
                    iterations: *iterations,
                    modified: *modified,
                };
                Ok(())
            }
            _ => Err(self.invalid("checkpointed")),
        }
    }

    /// Transition: * (non-terminal) → FAILED
    pub fn fail(&mut self, error: String, error_category: ErrorCategory) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("failed"));
        }
        self.state = ItemState::Failed {
            failed_at: Utc::now(),
            failed_in: self.state.state_name().to_string(),
            error,
            error_category,
        };
        Ok(())
    }

    /// Wall-clock time since locking began, if started
    pub fn elapsed(&self) -> Option<Duration> {
        self.state
            .started_at()
            .and_then(|t| (Utc::now() - t).to_std().ok())
    }
}
