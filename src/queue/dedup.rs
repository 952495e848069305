//! Best-effort duplicate suppression.
//!
//! Backends with at-least-once delivery may hand the same message to a
//! consumer twice within a short window. A [`DuplicateDetector`] remembers
//! recently seen `(queue, message id)` pairs so the fetch loop can drop the
//! repeat before it reaches the batcher. Detection never blocks: if the
//! window is contended the message is treated as new.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use super::{Consumer, Message, MessageId};
use crate::error::QueueError;

/// Decides whether a fetched message was already seen recently.
pub trait DuplicateDetector: Send + Sync {
    /// Records the message and returns `true` if it was seen within the window.
    fn found_duplicate(&self, queue: &str, id: &MessageId) -> bool;

    /// Forgets a message so a later redelivery is not suppressed.
    fn forget(&self, _queue: &str, _id: &MessageId) {}
}

/// Detector that never reports duplicates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDuplicateDetection;

impl DuplicateDetector for NoDuplicateDetection {
    fn found_duplicate(&self, _queue: &str, _id: &MessageId) -> bool {
        false
    }
}

type SeenKey = (String, MessageId);

#[derive(Default)]
struct SeenWindow {
    seen: HashMap<SeenKey, Instant>,
    order: VecDeque<(SeenKey, Instant)>,
}

impl SeenWindow {
    fn expire(&mut self, now: Instant, ttl: Duration) {
        while let Some((key, seen_at)) = self.order.front() {
            if now.duration_since(*seen_at) < ttl {
                break;
            }
            // Only drop the map entry if it was not refreshed since.
            if self.seen.get(key) == Some(seen_at) {
                self.seen.remove(key);
            }
            self.order.pop_front();
        }
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.seen.len() > capacity {
            match self.order.pop_front() {
                Some((key, seen_at)) => {
                    if self.seen.get(&key) == Some(&seen_at) {
                        self.seen.remove(&key);
                    }
                }
                None => break,
            }
        }
    }
}

/// In-process TTL window with bounded capacity.
pub struct MemoryDuplicateDetector {
    ttl: Duration,
    capacity: usize,
    window: Mutex<SeenWindow>,
}

impl MemoryDuplicateDetector {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            window: Mutex::new(SeenWindow::default()),
        }
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.window
            .lock()
            .map(|w| w.seen.len())
            .unwrap_or_else(|p| p.into_inner().seen.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_at(&self, queue: &str, id: &MessageId, now: Instant) -> bool {
        let mut window = match self.window.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };

        window.expire(now, self.ttl);

        let key = (queue.to_string(), id.clone());
        if window.seen.contains_key(&key) {
            return true;
        }

        window.seen.insert(key.clone(), now);
        window.order.push_back((key, now));
        window.evict_to(self.capacity);
        false
    }
}

impl DuplicateDetector for MemoryDuplicateDetector {
    fn found_duplicate(&self, queue: &str, id: &MessageId) -> bool {
        self.check_at(queue, id, Instant::now())
    }

    fn forget(&self, queue: &str, id: &MessageId) {
        let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        window.seen.remove(&(queue.to_string(), id.clone()));
    }
}

/// Consumer decorator that clears a message from the detector whenever it
/// goes back to the backend without an ack.
///
/// A rejected message is redelivered immediately and a released one after
/// the backend's visibility timeout, usually with the same id. Neither must
/// be mistaken for a duplicate.
pub struct Deduplicated {
    inner: Arc<dyn Consumer>,
    detector: Arc<dyn DuplicateDetector>,
}

impl Deduplicated {
    pub fn new(inner: Arc<dyn Consumer>, detector: Arc<dyn DuplicateDetector>) -> Self {
        Self { inner, detector }
    }
}

impl Consumer for Deduplicated {
    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    fn fetch(&self, timeout: Duration) -> Result<Option<Message>, QueueError> {
        self.inner.fetch(timeout)
    }

    fn complete(&self, id: &MessageId) -> Result<(), QueueError> {
        self.inner.complete(id)
    }

    fn reject(&self, id: &MessageId) -> Result<(), QueueError> {
        self.detector.forget(self.inner.queue_name(), id);
        self.inner.reject(id)
    }

    fn stop(&self) {
        self.inner.stop()
    }

    fn release(&self, id: &MessageId) {
        self.detector.forget(self.inner.queue_name(), id);
        self.inner.release(id)
    }
}
