//! Run counters, with optional Prometheus export (`metrics` feature)

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RunMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    modified: AtomicU64,
    lock_timeouts: AtomicU64,
    throttle_timeouts: AtomicU64,
    worker_panics: AtomicU64,
    iterations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub modified: u64,
    pub lock_timeouts: u64,
    pub throttle_timeouts: u64,
    pub worker_panics: u64,
    pub iterations: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, modified: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        if modified {
            self.modified.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle_timeout(&self) {
        self.throttle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.worker_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            modified: self.modified.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            throttle_timeouts: self.throttle_timeouts.load(Ordering::Relaxed),
            worker_panics: self.worker_panics.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.processed,
            &self.succeeded,
            &self.failed,
            &self.modified,
            &self.lock_timeouts,
            &self.throttle_timeouts,
            &self.worker_panics,
            &self.iterations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(feature = "metrics")]
pub use exporter::PrometheusExporter;

#[cfg(feature = "metrics")]
mod exporter {
    use super::MetricsSnapshot;
    use crate::error::{OrchestratorError, Result};
    use prometheus::{IntGauge, Opts, Registry};

    /// Publishes [`MetricsSnapshot`]s as gauges
    pub struct PrometheusExporter {
        registry: Registry,
        gauges: Vec<(&'static str, IntGauge)>,
    }

    const GAUGES: [(&str, &str); 8] = [
        ("processed", "Items processed in the last run"),
        ("succeeded", "Items that completed successfully"),
        ("failed", "Items that failed"),
        ("modified", "Items the worker modified"),
        ("lock_timeouts", "Resource lock acquisitions that timed out"),
        ("throttle_timeouts", "Throttle admissions that timed out"),
        ("worker_panics", "Worker calls that panicked"),
        ("iterations", "Worker iterations executed"),
    ];

    impl PrometheusExporter {
        pub fn new(registry: Registry) -> Result<Self> {
            let mut gauges = Vec::with_capacity(GAUGES.len());
            for (name, help) in GAUGES {
                let gauge = IntGauge::with_opts(Opts::new(format!("agent_runner_{}", name), help))
                    .map_err(OrchestratorError::config)?;
                registry
                    .register(Box::new(gauge.clone()))
                    .map_err(OrchestratorError::config)?;
                gauges.push((name, gauge));
            }
            Ok(Self { registry, gauges })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        pub fn publish(&self, snapshot: &MetricsSnapshot) {
            for (name, gauge) in &self.gauges {
                let value = match *name {
                    "processed" => snapshot.processed,
                    "succeeded" => snapshot.succeeded,
                    "failed" => snapshot.failed,
                    "modified" => snapshot.modified,
                    "lock_timeouts" => snapshot.lock_timeouts,
                    "throttle_timeouts" => snapshot.throttle_timeouts,
                    "worker_panics" => snapshot.worker_panics,
                    _ => snapshot.iterations,
                };
                gauge.set(value as i64);
            }
        }
    }

}
