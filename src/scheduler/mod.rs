//! Consumer-side pipeline: fetch, batch, distribute.
//!
//! ```text
//!   queue A ──fetch thread──┐
//!   queue B ──fetch thread──┼──► Batcher ──flush──► WorkDistributor ──► ready workers
//!   queue C ──fetch thread──┘       ▲
//!                              idle timer
//! ```
//!
//! - **ConsumerStrategy**: one OS thread per queue, duplicate suppression
//! - **Batcher**: size- and idle-bounded batches, swap-and-clear under one lock
//! - **WorkDistributor**: one pending batch per ready worker, oldest first
//!
//! Ordering is preserved per queue; units from different queues may
//! interleave.

pub mod batcher;
pub mod distributor;
pub mod fetcher;

pub use batcher::{Batch, Batcher, FlushCallback, FlushTrigger};
pub use distributor::{Assignment, WorkDistributor};
pub use fetcher::{ConsumerStrategy, FetchStopper, FetcherHandle};
