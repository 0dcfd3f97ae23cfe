//! agent-runner: run a command over changed files with checkpoint/resume
//!
//! Exit status: 0 when the run completed (per-item failures are reported in
//! the summary), 3 when interrupted by a shutdown request, 1 on fatal errors.

use agent_orchestration::{
    collect_candidates, telemetry, BlockingWorker, CommandRunner, CommandWorker, ExecutionMode,
    LoggingHook, RunSummary, RunnerConfig, TaskRunner,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

const EXIT_INTERRUPTED: u8 = 3;

#[derive(Parser)]
#[command(name = "agent-runner", version, about = "Incremental, resumable per-file task runner")]
struct Cli {
    /// YAML configuration file (schema version 1)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tracing filter directive, e.g. `debug` or `agent_orchestration=trace`
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process changed files under ROOT
    Run {
        root: PathBuf,

        /// Program to run per file
        #[arg(long)]
        command: String,

        /// Argument for the program; `{file}` is replaced by the item path
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,

        /// sequential | thread_pool | async
        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Forget previous fingerprints before running
        #[arg(long)]
        reset: bool,
    },
    /// Show tracked files and any resumable checkpoint
    Status,
    /// Delete persisted state
    Reset,
}

fn load_config(path: Option<&Path>) -> Result<RunnerConfig> {
    match path {
        Some(path) => RunnerConfig::from_yaml(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => {
            let mut config = RunnerConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(
    mut config: RunnerConfig,
    root: PathBuf,
    program: String,
    args: Vec<String>,
    mode: Option<String>,
    batch_size: Option<usize>,
    reset: bool,
) -> Result<RunSummary> {
    if let Some(mode) = mode {
        config.batch.mode = ExecutionMode::from_str(&mode)?;
    }
    if let Some(size) = batch_size {
        config.batch.batch_size = size;
    }

    let mut runner = TaskRunner::from_config(&config).context("failed to initialize runner")?;
    runner.add_hook(Arc::new(LoggingHook));
    runner.shutdown_signal().register_os_signals()?;
    if reset {
        runner.reset_state();
    }

    let candidates = collect_candidates(&root, &config.discovery)
        .with_context(|| format!("cannot enumerate {}", root.display()))?;
    info!("{} candidate files under {}", candidates.len(), root.display());

    let worker = CommandWorker::new(program, args, CommandRunner::from_config(&config.retry));
    let summary = match config.batch.mode {
        ExecutionMode::Async => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(runner.run_async(&candidates, &worker))?
        }
        ExecutionMode::Sequential | ExecutionMode::ThreadPool => {
            runner.run(&candidates, &BlockingWorker::new(worker)?)?
        }
    };
    Ok(summary)
}

fn real_main(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    telemetry::init_tracing(cli.log.as_deref().or(config.log_filter.as_deref()));

    match cli.command {
        Commands::Run {
            root,
            command,
            args,
            mode,
            batch_size,
            reset,
        } => {
            let summary = run(config, root, command, args, mode, batch_size, reset)?;
            print_json(&summary)?;
            if summary.is_complete() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_INTERRUPTED))
            }
        }
        Commands::Status => {
            let runner = TaskRunner::from_config(&config)?;
            print_json(&runner.status())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset => {
            let runner = TaskRunner::from_config(&config)?;
            runner.reset_state();
            println!("State in {} reset", config.state_dir.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    match real_main(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("agent-runner: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
