//! Subprocess execution with a hard timeout and bounded retries

use crate::config::RetryConfig;
use crate::error::{OrchestratorError, Result};
use crate::fingerprint::hash_file;
use crate::job::{retry_backoff, WorkItem};
use crate::worker::{AsyncWorker, WorkOutput};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Placeholder replaced by the item path in argument templates
pub const FILE_PLACEHOLDER: &str = "{file}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Failed { exit_code: Option<i32> },
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    /// Invocations made, including the successful one
    pub attempts: u32,
    pub elapsed_secs: f64,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    max_retries: u32,
    backoff_cap: Duration,
    current_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_retries: 0,
            backoff_cap: Duration::from_secs(30),
            current_dir: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.command_timeout()).with_retries(config.max_retries, config.backoff_cap())
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_cap: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_cap = backoff_cap;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Single invocation; the child is killed if it outlives the timeout
    ///
    /// `Err` only when the program cannot be started.
    pub async fn run_once(&self, program: &str, args: &[String]) -> Result<CommandOutcome> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let start = Instant::now();
        let child = command.spawn().map_err(|e| {
            OrchestratorError::CommandFailed(format!("failed to spawn {}: {}", program, e))
        })?;

        let outcome = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandOutcome {
                status: if output.status.success() {
                    CommandStatus::Success
                } else {
                    CommandStatus::Failed {
                        exit_code: output.status.code(),
                    }
                },
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                attempts: 1,
                elapsed_secs: start.elapsed().as_secs_f64(),
            },
            Ok(Err(e)) => {
                return Err(OrchestratorError::CommandFailed(format!(
                    "failed waiting for {}: {}",
                    program, e
                )))
            }
            // Dropping the wait future drops the child, which kills it
            Err(_) => CommandOutcome {
                status: CommandStatus::TimedOut,
                stdout: String::new(),
                stderr: String::new(),
                attempts: 1,
                elapsed_secs: start.elapsed().as_secs_f64(),
            },
        };
        Ok(outcome)
    }

    /// Invoke, retrying non-zero exits and timeouts up to `max_retries`
    ///
    /// Waits `min(2^attempt, backoff_cap)` seconds between attempts.
    pub async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutcome> {
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut outcome = self.run_once(program, args).await?;
            outcome.attempts = attempt;
            outcome.elapsed_secs = start.elapsed().as_secs_f64();

            if outcome.is_success() || attempt > self.max_retries {
                if !outcome.is_success() {
                    warn!(program, attempts = attempt, status = ?outcome.status, "command gave up");
                }
                return Ok(outcome);
            }

            let backoff = retry_backoff(attempt, self.backoff_cap);
            debug!(
                program,
                attempt,
                status = ?outcome.status,
                backoff_ms = backoff.as_millis() as u64,
                "command failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Runs a program per item and reports whether the item's file changed
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    runner: CommandRunner,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>, runner: CommandRunner) -> Self {
        Self {
            program: program.into(),
            args,
            runner,
        }
    }

    /// Substitute `{file}`; the path is appended when no argument mentions it
    pub fn render_args(&self, item: &WorkItem) -> Vec<String> {
        let file = item.identity.as_str();
        let mut rendered: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(FILE_PLACEHOLDER, file))
            .collect();
        if !self.args.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
            rendered.push(file.to_string());
        }
        rendered
    }
}

#[async_trait]
impl AsyncWorker for CommandWorker {
    async fn process(&self, item: &WorkItem) -> anyhow::Result<WorkOutput> {
        let before = hash_file(item.path()).ok();
        let args = self.render_args(item);
        let outcome = self.runner.run(&self.program, &args).await?;

        match &outcome.status {
            CommandStatus::Success => {}
            CommandStatus::TimedOut => {
                return Err(OrchestratorError::Timeout(format!(
                    "{} on {} exceeded {:?} ({} attempts)",
                    self.program,
                    item.identity,
                    self.runner.timeout(),
                    outcome.attempts
                ))
                .into())
            }
            CommandStatus::Failed { exit_code } => {
                let stderr = outcome.stderr.trim();
                return Err(OrchestratorError::CommandFailed(format!(
                    "{} on {} exited with {:?} after {} attempts: {}",
                    self.program, item.identity, exit_code, outcome.attempts, stderr
                ))
                .into());
            }
        }

        let after = hash_file(item.path()).ok();
        Ok(WorkOutput {
            changed: before != after,
            detail: Some(serde_json::json!({
                "attempts": outcome.attempts,
                "elapsed_secs": outcome.elapsed_secs,
            })),
        })
    }

    fn name(&self) -> &str {
        &self.program
    }
}
