//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use super::prometheus::{
    BATCHES_FLUSHED_TOTAL, DUPLICATES_SKIPPED_TOTAL, JOBS_FINISHED_TOTAL, JOB_DURATION,
    PENDING_BATCHES, WORKERS, WORKER_RESPAWNS_TOTAL,
};
use crate::scheduler::FlushTrigger;

/// `class` label value for a job whose body could not be decoded.
const UNKNOWN_CLASS: &str = "unknown";

/// Metrics collector for recording jobforge operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished job.
    ///
    /// # Arguments
    ///
    /// * `state` - Finished state (`completed`, `failed`, `timeout`, `rejected`)
    /// * `queue` - Queue the message was fetched from
    /// * `class` - Job class name, if the body could be decoded
    /// * `duration_secs` - Execution duration in seconds
    pub fn record_finished(
        &self,
        state: &str,
        queue: &str,
        class: Option<&str>,
        duration_secs: f64,
    ) {
        let class = class.unwrap_or(UNKNOWN_CLASS);
        if let Some(finished) = JOBS_FINISHED_TOTAL.get() {
            finished.with_label_values(&[state, queue, class]).inc();
        }

        if let Some(duration) = JOB_DURATION.get() {
            duration.with_label_values(&[state]).observe(duration_secs);
        }

        tracing::trace!(
            state = state,
            queue = queue,
            class = class,
            duration_secs = duration_secs,
            "Recorded finished job metric"
        );
    }

    /// Set the number of live worker processes.
    pub fn set_workers(&self, count: usize) {
        if let Some(workers) = WORKERS.get() {
            workers.set(count as f64);
        }
    }

    /// Record a worker process spawned to replace a dead one.
    pub fn record_respawn(&self) {
        if let Some(respawns) = WORKER_RESPAWNS_TOTAL.get() {
            respawns.inc();
        }
    }

    /// Record a flushed batch.
    pub fn record_batch_flushed(&self, trigger: FlushTrigger) {
        if let Some(flushed) = BATCHES_FLUSHED_TOTAL.get() {
            flushed.with_label_values(&[trigger.as_str()]).inc();
        }
    }

    /// Set the number of batches waiting for a ready worker.
    pub fn set_pending_batches(&self, count: usize) {
        if let Some(pending) = PENDING_BATCHES.get() {
            pending.set(count as f64);
        }
    }

    /// Record a message dropped as a duplicate.
    pub fn record_duplicate(&self, queue: &str) {
        if let Some(duplicates) = DUPLICATES_SKIPPED_TOTAL.get() {
            duplicates.with_label_values(&[queue]).inc();
        }
    }
}
