//! Master-side bookkeeping for one worker process.
//!
//! ```text
//! Spawning ──Ready──► Ready ──assign──► Busy ──finish──► Ready
//!     │                 │                 │
//!     └─────────────────┴──── mark_dead ──┴──► Dead
//! ```
//!
//! `Dead` is terminal: the supervisor drops the handle and spawns a
//! replacement with a fresh id.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::UnitOfWork;

/// Pool-unique worker identifier. Never reused within one master run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Dead,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Spawning => "spawning",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Dead => "dead",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change the handle refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{worker} cannot go from {from} to {to}")]
pub struct TransitionError {
    pub worker: WorkerId,
    pub from: WorkerState,
    pub to: WorkerState,
}

/// The batch a busy worker is running.
#[derive(Debug)]
pub struct InFlight {
    pub batch_id: u64,
    pub units: Vec<UnitOfWork>,
    pub assigned_at: Instant,
}

impl InFlight {
    /// Removes and returns the unit with `id`, if present.
    pub fn take(&mut self, id: &crate::queue::MessageId) -> Option<UnitOfWork> {
        let index = self.units.iter().position(|u| u.id() == id)?;
        Some(self.units.remove(index))
    }

    /// Leaves every remaining unit unacknowledged.
    pub fn abandon(self) {
        for unit in self.units {
            unit.abandon();
        }
    }
}

/// State of one worker process as seen by the master.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
    state: WorkerState,
    in_flight: Option<InFlight>,
    spawned_at: Instant,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, pid: Option<u32>) -> Self {
        Self {
            id,
            pid,
            state: WorkerState::Spawning,
            in_flight: None,
            spawned_at: Instant::now(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == WorkerState::Ready
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    fn refuse(&self, to: WorkerState) -> TransitionError {
        TransitionError {
            worker: self.id,
            from: self.state,
            to,
        }
    }

    /// `Spawning → Ready`, on the worker's first `Ready` message.
    pub fn mark_ready(&mut self) -> Result<(), TransitionError> {
        if self.state != WorkerState::Spawning {
            return Err(self.refuse(WorkerState::Ready));
        }
        self.state = WorkerState::Ready;
        Ok(())
    }

    /// `Ready → Busy`. The handle owns the units until they are settled.
    pub fn assign(&mut self, batch_id: u64, units: Vec<UnitOfWork>) -> Result<(), TransitionError> {
        if self.state != WorkerState::Ready {
            return Err(self.refuse(WorkerState::Busy));
        }
        self.state = WorkerState::Busy;
        self.in_flight = Some(InFlight {
            batch_id,
            units,
            assigned_at: Instant::now(),
        });
        Ok(())
    }

    /// `Busy → Ready` for the batch with `batch_id`.
    pub fn finish(&mut self, batch_id: u64) -> Result<InFlight, TransitionError> {
        match self.in_flight.take() {
            Some(in_flight) if self.state == WorkerState::Busy && in_flight.batch_id == batch_id => {
                self.state = WorkerState::Ready;
                Ok(in_flight)
            }
            other => {
                self.in_flight = other;
                Err(self.refuse(WorkerState::Ready))
            }
        }
    }

    /// Any state `→ Dead`. Returns whatever was in flight.
    pub fn mark_dead(&mut self) -> Option<InFlight> {
        self.state = WorkerState::Dead;
        self.in_flight.take()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::queue::{Consumer, MemoryQueue};

    fn units(queue: &Arc<MemoryQueue>, n: usize) -> Vec<UnitOfWork> {
        (0..n)
            .map(|i| {
                queue.push(format!("job-{}", i));
                let m = queue.fetch(Duration::from_millis(10)).unwrap().unwrap();
                UnitOfWork::new(m.id, m.body, queue.clone())
            })
            .collect()
    }

    #[test]
    fn test_full_lifecycle() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let mut handle = WorkerHandle::new(WorkerId(1), Some(4242));
        assert_eq!(handle.state(), WorkerState::Spawning);

        handle.mark_ready().unwrap();
        assert!(handle.is_ready());

        handle.assign(10, units(&queue, 2)).unwrap();
        assert_eq!(handle.state(), WorkerState::Busy);
        assert_eq!(handle.in_flight().unwrap().units.len(), 2);

        let in_flight = handle.finish(10).unwrap();
        assert_eq!(in_flight.batch_id, 10);
        assert_eq!(handle.state(), WorkerState::Ready);
        assert!(handle.in_flight().is_none());
    }

    #[test]
    fn test_busy_worker_refuses_second_assignment() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let mut handle = WorkerHandle::new(WorkerId(1), None);
        handle.mark_ready().unwrap();
        handle.assign(1, units(&queue, 1)).unwrap();

        let err = handle.assign(2, Vec::new()).unwrap_err();
        assert_eq!(err.from, WorkerState::Busy);
        assert_eq!(err.to, WorkerState::Busy);
        assert_eq!(handle.in_flight().unwrap().batch_id, 1);
    }

    #[test]
    fn test_spawning_worker_cannot_be_assigned() {
        let mut handle = WorkerHandle::new(WorkerId(3), None);
        assert!(handle.assign(1, Vec::new()).is_err());
        assert!(handle.mark_ready().is_ok());
        assert!(handle.mark_ready().is_err());
    }

    #[test]
    fn test_finish_with_wrong_batch_keeps_work() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let mut handle = WorkerHandle::new(WorkerId(1), None);
        handle.mark_ready().unwrap();
        handle.assign(5, units(&queue, 1)).unwrap();

        assert!(handle.finish(6).is_err());
        assert_eq!(handle.state(), WorkerState::Busy);
        assert_eq!(handle.in_flight().unwrap().batch_id, 5);
    }

    #[test]
    fn test_mark_dead_returns_in_flight_units() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let mut handle = WorkerHandle::new(WorkerId(1), None);
        handle.mark_ready().unwrap();
        handle.assign(1, units(&queue, 3)).unwrap();

        let in_flight = handle.mark_dead().unwrap();
        assert_eq!(in_flight.units.len(), 3);
        assert_eq!(handle.state(), WorkerState::Dead);
        assert!(handle.mark_ready().is_err());

        in_flight.abandon();
        assert_eq!(queue.in_flight_len(), 3);
    }

    #[test]
    fn test_in_flight_take_by_id() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let batch = units(&queue, 2);
        let second = batch[1].id().clone();
        let mut in_flight = InFlight {
            batch_id: 1,
            units: batch,
            assigned_at: Instant::now(),
        };

        let unit = in_flight.take(&second).unwrap();
        assert_eq!(unit.id(), &second);
        assert!(in_flight.take(&second).is_none());
        assert_eq!(in_flight.units.len(), 1);
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(7).to_string(), "worker-7");
        assert_eq!(WorkerState::Busy.to_string(), "busy");
    }
}
