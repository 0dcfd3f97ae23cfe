//! Runner configuration (YAML schema v1)
//!
//! Every section is optional; an otherwise empty document with `version: 1`
//! yields the defaults below.

use crate::error::{OrchestratorError, Result};
use crate::job::Priority;
use crate::priority::FilePriorityManager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;

/// Overrides `state_dir` when set
pub const STATE_DIR_ENV: &str = "AGENT_RUNNER_STATE_DIR";

pub const INDEX_FILE_NAME: &str = "incremental_state.json";
pub const CHECKPOINT_FILE_NAME: &str = "shutdown_state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    ThreadPool,
    Async,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::ThreadPool => "thread_pool",
            ExecutionMode::Async => "async",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(ExecutionMode::Sequential),
            "thread_pool" | "thread-pool" | "threads" => Ok(ExecutionMode::ThreadPool),
            "async" => Ok(ExecutionMode::Async),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid execution mode: {}",
                s
            ))),
        }
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Sequential
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_workers() -> usize {
    (num_cpus::get() * 3 / 4).max(1)
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub enabled: bool,
    /// Wait bound for one acquisition
    pub timeout_secs: f64,
    /// Locks older than this are treated as abandoned
    pub ttl_secs: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30.0,
            ttl_secs: 300.0,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn ttl(&self) -> Duration {
        secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst_size: u32,
    /// Admission wait bound; `None` waits as long as needed
    pub timeout_secs: Option<f64>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10.0,
            burst_size: 10,
            timeout_secs: Some(60.0),
        }
    }
}

impl ThrottleConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Worker iterations per item before giving up on convergence
    pub max_iterations: u32,
    pub mode: ExecutionMode,
    /// Thread-pool size
    pub workers: usize,
    /// In-flight items in async mode
    pub async_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_iterations: 3,
            mode: ExecutionMode::default(),
            workers: default_workers(),
            async_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_cap_secs: f64,
    /// Hard wall-clock limit per subprocess invocation
    pub command_timeout_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_cap_secs: 30.0,
            command_timeout_secs: 300.0,
        }
    }
}

impl RetryConfig {
    pub fn backoff_cap(&self) -> Duration {
        secs(self.backoff_cap_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Extensions to keep, without the dot; empty keeps every file
    pub extensions: Vec<String>,
    /// Directory names never descended into
    pub exclude_dirs: Vec<String>,
    pub include_hidden: bool,
    pub follow_links: bool,
    pub max_depth: Option<usize>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            exclude_dirs: [".git", "target", "node_modules", "__pycache__", ".venv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            include_hidden: false,
            follow_links: false,
            max_depth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternRule {
    pub pattern: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityConfig {
    pub default: Priority,
    /// Checked in order; first match wins
    pub patterns: Vec<PatternRule>,
    pub extensions: BTreeMap<String, Priority>,
}

impl PriorityConfig {
    pub fn build(&self) -> Result<FilePriorityManager> {
        let mut manager = FilePriorityManager::new(self.default);
        for rule in &self.patterns {
            manager.add_pattern(&rule.pattern, rule.priority)?;
        }
        for (ext, priority) in &self.extensions {
            manager.set_extension(ext, *priority);
        }
        Ok(manager)
    }
}

// ============================================================================
// Root document
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub priority: PriorityConfig,

    /// Tracing filter directive, used when the env filter is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".agent_state")
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            state_dir: default_state_dir(),
            batch: BatchConfig::default(),
            lock: LockConfig::default(),
            throttle: ThrottleConfig::default(),
            retry: RetryConfig::default(),
            discovery: DiscoveryConfig::default(),
            priority: PriorityConfig::default(),
            log_filter: None,
        }
    }
}

impl RunnerConfig {
    /// Load, apply environment overrides, validate
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse_yaml(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate without consulting the environment
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config = Self::parse_yaml(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_yaml(content: &str) -> Result<Self> {
        let config: RunnerConfig = serde_yaml::from_str(content)?;
        if config.version != CONFIG_VERSION {
            return Err(OrchestratorError::UnsupportedVersion {
                found: config.version,
                expected: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(STATE_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.state_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch.batch_size < 1 {
            return Err(OrchestratorError::config("batch.batch_size must be >= 1"));
        }
        if self.batch.workers < 1 {
            return Err(OrchestratorError::config("batch.workers must be >= 1"));
        }
        if self.batch.max_iterations < 1 {
            return Err(OrchestratorError::config(
                "batch.max_iterations must be >= 1",
            ));
        }
        if self.batch.async_concurrency < 1 {
            return Err(OrchestratorError::config(
                "batch.async_concurrency must be >= 1",
            ));
        }
        let rate = self.throttle.requests_per_second;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(OrchestratorError::config(
                "throttle.requests_per_second must be > 0",
            ));
        }
        if self.throttle.burst_size < 1 {
            return Err(OrchestratorError::config("throttle.burst_size must be >= 1"));
        }

        let durations = [
            ("lock.timeout_secs", Some(self.lock.timeout_secs)),
            ("lock.ttl_secs", Some(self.lock.ttl_secs)),
            ("throttle.timeout_secs", self.throttle.timeout_secs),
            ("retry.backoff_cap_secs", Some(self.retry.backoff_cap_secs)),
            (
                "retry.command_timeout_secs",
                Some(self.retry.command_timeout_secs),
            ),
        ];
        for (name, value) in durations {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(OrchestratorError::config(format!(
                        "{} must be a non-negative number, got {}",
                        name, v
                    )));
                }
            }
        }

        self.priority.build()?;
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.state_dir.join(INDEX_FILE_NAME)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join(CHECKPOINT_FILE_NAME)
    }
}
