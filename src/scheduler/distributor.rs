//! Assignment of pending batches to ready workers.
//!
//! The distributor is pure bookkeeping: it holds flushed batches in arrival
//! order and, given the workers that are currently ready, pairs each with at
//! most one batch. Sending the assignment is the supervisor's job.

use std::collections::VecDeque;

use super::batcher::Batch;
use crate::pool::handle::WorkerId;

/// A batch paired with the worker that should run it.
#[derive(Debug)]
pub struct Assignment {
    pub worker_id: WorkerId,
    pub batch: Batch,
}

/// FIFO of batches waiting for a ready worker.
#[derive(Debug, Default)]
pub struct WorkDistributor {
    pending: VecDeque<Batch>,
}

impl WorkDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a batch behind everything already pending. Empty batches are dropped.
    pub fn push(&mut self, batch: Batch) {
        if !batch.is_empty() {
            self.pending.push_back(batch);
        }
    }

    /// Puts a batch back at the head, e.g. when its worker died before receiving it.
    pub fn requeue_front(&mut self, batch: Batch) {
        if !batch.is_empty() {
            self.pending.push_front(batch);
        }
    }

    /// Pairs each ready worker, in the given order, with the oldest pending batch.
    ///
    /// Workers beyond the number of pending batches get nothing and stay ready.
    pub fn assign<I>(&mut self, ready: I) -> Vec<Assignment>
    where
        I: IntoIterator<Item = WorkerId>,
    {
        let mut assignments = Vec::new();
        for worker_id in ready {
            let Some(batch) = self.pending.pop_front() else {
                break;
            };
            assignments.push(Assignment { worker_id, batch });
        }
        assignments
    }

    /// Removes every pending batch, oldest first.
    pub fn drain(&mut self) -> Vec<Batch> {
        self.pending.drain(..).collect()
    }

    /// Number of batches waiting.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of units across all waiting batches.
    pub fn pending_units(&self) -> usize {
        self.pending.iter().map(Batch::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
