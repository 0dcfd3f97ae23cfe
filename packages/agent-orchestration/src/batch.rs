//! Priority-ordered work queue with bounded batch extraction
//!
//! One item's failure never aborts its batch: every drained item yields
//! exactly one [`BatchResult`].

use crate::job::WorkItem;
use crate::worker::{invoke, WorkOutput, Worker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub identity: String,
    pub success: bool,
    pub output: Option<WorkOutput>,
    pub error: Option<String>,
    pub processing_time_seconds: f64,
}

impl BatchResult {
    pub fn succeeded(identity: impl Into<String>, output: WorkOutput, secs: f64) -> Self {
        Self {
            identity: identity.into(),
            success: true,
            output: Some(output),
            error: None,
            processing_time_seconds: secs,
        }
    }

    pub fn failed(identity: impl Into<String>, error: impl Into<String>, secs: f64) -> Self {
        Self {
            identity: identity.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            processing_time_seconds: secs,
        }
    }
}

/// Aggregate statistics over processed results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_time: f64,
    pub total_time: f64,
}

impl BatchStats {
    pub fn from_results(results: &[BatchResult]) -> Self {
        let mut stats = Self::default();
        for result in results {
            stats.record(result);
        }
        stats
    }

    pub fn record(&mut self, result: &BatchResult) {
        self.processed += 1;
        if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.total_time += result.processing_time_seconds;
        self.success_rate = self.successful as f64 / self.processed as f64;
        self.avg_time = self.total_time / self.processed as f64;
    }
}

struct Inner {
    items: Vec<WorkItem>,
    next_seq: u64,
}

pub struct BatchQueue {
    inner: Mutex<Inner>,
    stats: Mutex<BatchStats>,
    batch_size: usize,
}

impl Default for BatchQueue {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl BatchQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                next_seq: 0,
            }),
            stats: Mutex::new(BatchStats::default()),
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn add(&self, mut item: WorkItem) {
        let mut inner = self.inner.lock();
        item.seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.push(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = WorkItem>) {
        for item in items {
            self.add(item);
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    /// Queued identities, in queue order
    pub fn identities(&self) -> Vec<String> {
        self.inner
            .lock()
            .items
            .iter()
            .map(|i| i.identity.clone())
            .collect()
    }

    /// Up to `max_size` items, priority descending, insertion order on ties
    ///
    /// Items not returned stay queued.
    pub fn drain_batch(&self, max_size: usize) -> Vec<WorkItem> {
        let mut inner = self.inner.lock();
        inner
            .items
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        let take = max_size.min(inner.items.len());
        let rest = inner.items.split_off(take);
        std::mem::replace(&mut inner.items, rest)
    }

    /// Run `worker` over `batch`, one result per item
    pub fn process_batch(&self, batch: Vec<WorkItem>, worker: &dyn Worker) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(batch.len());
        for mut item in batch {
            item.attempts += 1;
            let start = Instant::now();
            let outcome = invoke(worker, &item);
            let secs = start.elapsed().as_secs_f64();

            let result = match outcome {
                Ok(output) => {
                    debug!(item = %item.identity, secs, "batch item succeeded");
                    BatchResult::succeeded(&item.identity, output, secs)
                }
                Err(e) => {
                    warn!(
                        item = %item.identity,
                        category = %e.category(),
                        "batch item failed: {}",
                        e
                    );
                    BatchResult::failed(&item.identity, e.to_string(), secs)
                }
            };
            self.stats.lock().record(&result);
            results.push(result);
        }
        results
    }

    /// Drain and process batches until the queue is empty
    pub fn process_all(&self, worker: &dyn Worker) -> Vec<BatchResult> {
        let mut all = Vec::new();
        let mut batches = 0usize;
        loop {
            let batch = self.drain_batch(self.batch_size);
            if batch.is_empty() {
                break;
            }
            batches += 1;
            all.extend(self.process_batch(batch, worker));
        }

        let stats = self.stats();
        info!(
            "Processed {} batches: {}/{} successful ({:.1}%), avg {:.3}s",
            batches,
            stats.successful,
            stats.processed,
            stats.success_rate * 100.0,
            stats.avg_time
        );
        all
    }

    pub fn stats(&self) -> BatchStats {
        self.stats.lock().clone()
    }
}
