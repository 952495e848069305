//! jobforge: background job processing with a pre-spawned worker pool.
//!
//! Queue consumers feed a batcher; flushed batches are handed to a fixed set
//! of worker processes supervised by a single master event loop. Each worker
//! decodes and runs jobs under a deadline and reports a disposition per unit,
//! which the master applies to the originating queue.

pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use config::{Config, ConfigError};
pub use error::{EncodeError, HookError, JobError, QueueError};
pub use job::{JobDescriptor, JobOptions, JobRegistry};
pub use manager::{Manager, ManagerHandle};
pub use pool::{PoolError, ShutdownReason};
