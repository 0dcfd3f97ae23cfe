//! Tracing subscriber setup
//!
//! Filter priority: `AGENT_RUNNER_LOG`, then `RUST_LOG`, then the caller's
//! directive, then `info`.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "AGENT_RUNNER_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

fn build_env_filter(fallback: Option<&str>) -> EnvFilter {
    if let Ok(directives) = std::env::var(LOG_ENV) {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    fallback
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install a stderr fmt subscriber; returns false if one was already set
pub fn init_tracing(filter: Option<&str>) -> bool {
    let stderr_is_tty = std::io::IsTerminal::is_terminal(&std::io::stderr());
    tracing_subscriber::registry()
        .with(build_env_filter(filter))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(stderr_is_tty)
                .with_target(false),
        )
        .try_init()
        .is_ok()
}
