//! Cooperative shutdown flag
//!
//! The only thing that happens in signal context is a store to an atomic
//! bool (via `signal-hook`'s flag registration). The run loop polls the
//! flag between items; persisting the shutdown request is done by the
//! thread that observes it.

use crate::error::{OrchestratorError, Result};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Exit status used when a second SIGINT arrives during graceful shutdown
pub const FORCE_EXIT_STATUS: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT/SIGTERM into this flag
    ///
    /// A SIGINT received while the flag is already set terminates the
    /// process with [`FORCE_EXIT_STATUS`].
    pub fn register_os_signals(&self) -> Result<()> {
        // Order matters: the conditional shutdown must see the flag before
        // the plain registration sets it for the first signal.
        signal_hook::flag::register_conditional_shutdown(
            SIGINT,
            FORCE_EXIT_STATUS,
            Arc::clone(&self.flag),
        )
        .map_err(|e| OrchestratorError::config(format!("failed to register SIGINT: {}", e)))?;

        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.flag)).map_err(|e| {
                OrchestratorError::config(format!("failed to register signal {}: {}", signal, e))
            })?;
        }

        info!("Registered SIGINT/SIGTERM handlers for graceful shutdown");
        Ok(())
    }

    /// Request shutdown from non-signal sources (tests, callbacks)
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag for a fresh run
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
