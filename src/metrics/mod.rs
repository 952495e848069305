//! Metrics module for Prometheus-based monitoring.
//!
//! Records finished jobs (tagged by state, source queue and job class), job durations,
//! worker pool size and respawns, batch flushes and duplicate suppression.
//!
//! # Example
//!
//! ```ignore
//! use jobforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_finished("completed", "mail", Some("Echo"), 0.25);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    BATCHES_FLUSHED_TOTAL, DUPLICATES_SKIPPED_TOTAL, JOBS_FINISHED_TOTAL, JOB_DURATION,
    PENDING_BATCHES, REGISTRY, WORKERS, WORKER_RESPAWNS_TOTAL,
};
