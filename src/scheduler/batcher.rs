//! Size- and idle-bounded batching of units of work.
//!
//! The batch buffer and the flush callback share one critical section:
//! `flush` swaps the buffer for an empty one and runs the callback before
//! releasing the lock, so no caller ever observes a half-flushed batch and
//! no unit can land in two batches.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::job::hooks::panic_message;
use crate::queue::UnitOfWork;

/// Finest resolution of the idle-flush timer.
const MAX_TICK: Duration = Duration::from_secs(1);

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached its maximum size.
    Size,
    /// No unit was added for longer than the batch timeout.
    Idle,
    /// Flushed explicitly, e.g. during shutdown.
    Manual,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Idle => "idle",
            FlushTrigger::Manual => "manual",
        }
    }
}

/// An ordered group of units flushed together.
#[derive(Debug)]
pub struct Batch {
    pub units: Vec<UnitOfWork>,
    /// When the first unit of this batch was added.
    pub created_at: Instant,
    pub trigger: FlushTrigger,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Splits the batch in two halves, keeping unit order. The second half
    /// is empty only when the batch has fewer than two units.
    pub fn split(mut self) -> (Batch, Batch) {
        let tail = self.units.split_off(self.units.len() / 2);
        let rest = Batch {
            units: tail,
            created_at: self.created_at,
            trigger: self.trigger,
        };
        (self, rest)
    }

    /// Leaves every unit unacknowledged for backend redelivery.
    pub fn abandon(self) {
        for unit in self.units {
            unit.abandon();
        }
    }
}

struct BatchState {
    units: Vec<UnitOfWork>,
    created_at: Instant,
    last_added: Instant,
}

/// Callback receiving each flushed batch.
pub type FlushCallback = Box<dyn Fn(Batch) + Send + Sync>;

/// Accumulates units and hands them off in batches.
pub struct Batcher {
    max_size: usize,
    batch_timeout: Duration,
    state: Mutex<BatchState>,
    on_flush: FlushCallback,
}

impl Batcher {
    /// Creates a batcher.
    ///
    /// `max_size` is clamped to at least one.
    pub fn new<F>(max_size: usize, batch_timeout: Duration, on_flush: F) -> Self
    where
        F: Fn(Batch) + Send + Sync + 'static,
    {
        let now = Instant::now();
        Self {
            max_size: max_size.max(1),
            batch_timeout,
            state: Mutex::new(BatchState {
                units: Vec::with_capacity(max_size.max(1)),
                created_at: now,
                last_added: now,
            }),
            on_flush: Box::new(on_flush),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of units in the current batch.
    pub fn len(&self) -> usize {
        self.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a unit, flushing synchronously when the batch is full.
    ///
    /// Returns `true` if this call flushed.
    pub fn add(&self, unit: UnitOfWork) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        if state.units.is_empty() {
            state.created_at = now;
        }
        state.units.push(unit);
        state.last_added = now;

        if state.units.len() >= self.max_size {
            self.flush_locked(&mut state, FlushTrigger::Size)
        } else {
            false
        }
    }

    /// Flushes the current batch. A no-op when it is empty.
    pub fn flush(&self) -> bool {
        let mut state = self.lock();
        self.flush_locked(&mut state, FlushTrigger::Manual)
    }

    /// Flushes if the batch is non-empty and idle for longer than the timeout.
    pub fn flush_if_idle(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if state.units.is_empty() {
            return false;
        }
        if now.saturating_duration_since(state.last_added) <= self.batch_timeout {
            return false;
        }
        self.flush_locked(&mut state, FlushTrigger::Idle)
    }

    fn flush_locked(&self, state: &mut BatchState, trigger: FlushTrigger) -> bool {
        if state.units.is_empty() {
            return false;
        }

        let units = mem::replace(&mut state.units, Vec::with_capacity(self.max_size));
        let batch = Batch {
            units,
            created_at: state.created_at,
            trigger,
        };

        debug!(size = batch.len(), trigger = trigger.as_str(), "Flushing batch");
        (self.on_flush)(batch);
        true
    }

    /// Starts the idle-flush timer thread.
    ///
    /// The thread checks at most once per second (more often for shorter
    /// timeouts) and exits once `running` is cleared. A panic during a check
    /// is logged and the timer keeps going.
    pub fn schedule(self: &Arc<Self>, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        let batcher = Arc::clone(self);
        let tick = self.batch_timeout.min(MAX_TICK).max(Duration::from_millis(10));

        thread::Builder::new()
            .name("batch-timer".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    thread::sleep(tick);
                    if let Err(panic) =
                        catch_unwind(AssertUnwindSafe(|| batcher.flush_if_idle(Instant::now())))
                    {
                        error!(
                            error = %panic_message(&*panic),
                            "Batch timer check failed; continuing"
                        );
                    }
                }
                debug!("Batch timer stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Consumer, MemoryQueue, MessageId};

    fn collecting_batcher(
        max_size: usize,
        timeout: Duration,
    ) -> (Batcher, Arc<Mutex<Vec<Vec<MessageId>>>>) {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let batcher = Batcher::new(max_size, timeout, move |batch: Batch| {
            let ids: Vec<MessageId> = batch.units.iter().map(|u| u.id().clone()).collect();
            sink.lock().unwrap().push(ids);
        });
        (batcher, flushed)
    }

    fn units(queue: &Arc<MemoryQueue>, n: usize) -> Vec<UnitOfWork> {
        (0..n)
            .map(|i| {
                queue.push(format!("body-{}", i));
                let m = queue.fetch(Duration::from_millis(10)).unwrap().unwrap();
                UnitOfWork::new(m.id, m.body, queue.clone())
            })
            .collect()
    }

    #[test]
    fn test_flushes_exactly_at_max_size() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let (batcher, flushed) = collecting_batcher(3, Duration::from_secs(60));
        let all = units(&queue, 7);
        let ids: Vec<MessageId> = all.iter().map(|u| u.id().clone()).collect();

        let results: Vec<bool> = all.into_iter().map(|u| batcher.add(u)).collect();

        assert_eq!(results, vec![false, false, true, false, false, true, false]);
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0], ids[0..3].to_vec());
        assert_eq!(flushed[1], ids[3..6].to_vec());
        assert_eq!(batcher.len(), 1);
    }

    #[test]
    fn test_split_keeps_order_and_metadata() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let all = units(&queue, 5);
        let ids: Vec<MessageId> = all.iter().map(|u| u.id().clone()).collect();
        let created_at = Instant::now();
        let batch = Batch {
            units: all,
            created_at,
            trigger: FlushTrigger::Size,
        };

        let (head, tail) = batch.split();

        assert_eq!(head.len(), 2);
        assert_eq!(tail.len(), 3);
        let rejoined: Vec<MessageId> = head
            .units
            .iter()
            .chain(tail.units.iter())
            .map(|u| u.id().clone())
            .collect();
        assert_eq!(rejoined, ids);
        assert_eq!(tail.created_at, created_at);
        assert_eq!(tail.trigger, FlushTrigger::Size);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let (batcher, flushed) = collecting_batcher(3, Duration::from_secs(60));

        assert!(!batcher.flush());
        assert!(!batcher.flush_if_idle(Instant::now() + Duration::from_secs(3600)));
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_manual_flush_takes_partial_batch() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let (batcher, flushed) = collecting_batcher(10, Duration::from_secs(60));
        for unit in units(&queue, 2) {
            batcher.add(unit);
        }

        assert!(batcher.flush());
        assert!(!batcher.flush());
        assert_eq!(flushed.lock().unwrap().len(), 1);
        assert_eq!(flushed.lock().unwrap()[0].len(), 2);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_flush_if_idle_respects_timeout() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let (batcher, flushed) = collecting_batcher(10, Duration::from_secs(5));
        let start = Instant::now();
        for unit in units(&queue, 2) {
            batcher.add(unit);
        }

        assert!(!batcher.flush_if_idle(start + Duration::from_secs(1)));
        assert!(batcher.flush_if_idle(Instant::now() + Duration::from_secs(6)));
        assert!(!batcher.flush_if_idle(Instant::now() + Duration::from_secs(12)));
        assert_eq!(flushed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_timer_flushes_idle_batch_once() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let (batcher, flushed) = collecting_batcher(10, Duration::from_millis(100));
        let batcher = Arc::new(batcher);
        let running = Arc::new(AtomicBool::new(true));
        let timer = batcher.schedule(running.clone()).unwrap();

        for unit in units(&queue, 3) {
            batcher.add(unit);
        }
        thread::sleep(Duration::from_millis(500));

        running.store(false, Ordering::SeqCst);
        timer.join().unwrap();

        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].len(), 3);
    }

    #[test]
    fn test_timer_survives_panicking_callback() {
        let queue = Arc::new(MemoryQueue::new("q"));
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let batcher = Arc::new(Batcher::new(10, Duration::from_millis(50), move |_batch| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                drop(calls);
                panic!("sink unavailable");
            }
        }));
        let running = Arc::new(AtomicBool::new(true));
        let timer = batcher.schedule(running.clone()).unwrap();

        let mut pending = units(&queue, 2).into_iter();
        batcher.add(pending.next().unwrap());
        thread::sleep(Duration::from_millis(300));
        batcher.add(pending.next().unwrap());
        thread::sleep(Duration::from_millis(300));

        running.store(false, Ordering::SeqCst);
        timer.join().unwrap();

        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
