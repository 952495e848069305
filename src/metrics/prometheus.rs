//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished jobs, labeled by state and source queue.
pub static JOBS_FINISHED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job execution duration in seconds, labeled by state.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of live worker processes.
pub static WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Total worker processes spawned to replace dead ones.
pub static WORKER_RESPAWNS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Total batches flushed by the batcher, labeled by trigger (size/idle).
pub static BATCHES_FLUSHED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Number of batches waiting for a ready worker.
pub static PENDING_BATCHES: OnceLock<Gauge> = OnceLock::new();

/// Total messages dropped as duplicates, labeled by queue.
pub static DUPLICATES_SKIPPED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once: later calls leave the first registry in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Job metrics
    let jobs_finished_total = CounterVec::new(
        Opts::new("jobforge_jobs_finished_total", "Total number of finished jobs"),
        &["state", "queue", "class"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "jobforge_job_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["state"],
    )?;

    // Pool metrics
    let workers = Gauge::new("jobforge_workers", "Number of live worker processes")?;

    let worker_respawns_total = IntCounter::new(
        "jobforge_worker_respawns_total",
        "Total worker processes spawned to replace dead ones",
    )?;

    let pending_batches = Gauge::new(
        "jobforge_pending_batches",
        "Number of batches waiting for a ready worker",
    )?;

    // Consumer metrics
    let batches_flushed_total = IntCounterVec::new(
        Opts::new("jobforge_batches_flushed_total", "Total batches flushed"),
        &["trigger"],
    )?;

    let duplicates_skipped_total = IntCounterVec::new(
        Opts::new(
            "jobforge_duplicates_skipped_total",
            "Total messages dropped as duplicates",
        ),
        &["queue"],
    )?;

    registry.register(Box::new(jobs_finished_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(workers.clone()))?;
    registry.register(Box::new(worker_respawns_total.clone()))?;
    registry.register(Box::new(pending_batches.clone()))?;
    registry.register(Box::new(batches_flushed_total.clone()))?;
    registry.register(Box::new(duplicates_skipped_total.clone()))?;

    // If any of these fail, metrics were initialized concurrently
    let _ = REGISTRY.set(registry);
    let _ = JOBS_FINISHED_TOTAL.set(jobs_finished_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = WORKERS.set(workers);
    let _ = WORKER_RESPAWNS_TOTAL.set(worker_respawns_total);
    let _ = PENDING_BATCHES.set(pending_batches);
    let _ = BATCHES_FLUSHED_TOTAL.set(batches_flushed_total);
    let _ = DUPLICATES_SKIPPED_TOTAL.set(duplicates_skipped_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_recording() {
        init_metrics().unwrap();

        JOBS_FINISHED_TOTAL
            .get()
            .unwrap()
            .with_label_values(&["completed", "export-test", "Echo"])
            .inc();

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("jobforge_jobs_finished_total"));
        assert!(metrics.contains("export-test"));
    }
}
