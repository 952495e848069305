//! In-process queue backend.
//!
//! Messages live in a mutex-guarded deque; `fetch` moves a message into an
//! in-flight table until it is completed or rejected. Used by tests and by
//! `jobforge run` when no Redis URL is configured.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::{Consumer, ConsumerFactory, Message, MessageId, Publisher};
use crate::error::QueueError;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Message>,
    in_flight: HashMap<MessageId, Message>,
    completed: Vec<MessageId>,
    rejected: Vec<MessageId>,
    stopped: bool,
}

/// A single named in-memory queue.
pub struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a message and returns its generated id.
    pub fn push(&self, body: impl Into<Vec<u8>>) -> MessageId {
        let id = MessageId::new(Uuid::new_v4().to_string());
        self.push_message(Message::new(id.clone(), body));
        id
    }

    /// Appends a message with a caller-chosen id.
    pub fn push_message(&self, message: Message) {
        self.lock().pending.push_back(message);
        self.available.notify_one();
    }

    /// Ids acknowledged so far, in acknowledgement order.
    pub fn completed(&self) -> Vec<MessageId> {
        self.lock().completed.clone()
    }

    /// Ids rejected so far, in rejection order.
    pub fn rejected(&self) -> Vec<MessageId> {
        self.lock().rejected.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Returns every leased message to the head of the queue.
    ///
    /// Stands in for a backend's visibility timeout expiring.
    pub fn redeliver_in_flight(&self) -> usize {
        let mut state = self.lock();
        let leased: Vec<Message> = state.in_flight.drain().map(|(_, m)| m).collect();
        let count = leased.len();
        for message in leased {
            state.pending.push_front(message);
        }
        drop(state);
        self.available.notify_all();
        count
    }
}

impl Consumer for MemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, timeout: Duration) -> Result<Option<Message>, QueueError> {
        // No deadline when the timeout does not fit in an Instant.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();

        loop {
            if state.stopped {
                return Ok(None);
            }

            if let Some(message) = state.pending.pop_front() {
                state.in_flight.insert(message.id.clone(), message.clone());
                return Ok(Some(message));
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    match self.available.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    fn complete(&self, id: &MessageId) -> Result<(), QueueError> {
        let mut state = self.lock();
        state
            .in_flight
            .remove(id)
            .ok_or_else(|| QueueError::NotInFlight(id.to_string()))?;
        state.completed.push(id.clone());
        Ok(())
    }

    fn reject(&self, id: &MessageId) -> Result<(), QueueError> {
        let mut state = self.lock();
        let message = state
            .in_flight
            .remove(id)
            .ok_or_else(|| QueueError::NotInFlight(id.to_string()))?;
        state.rejected.push(id.clone());
        state.pending.push_front(message);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn stop(&self) {
        self.lock().stopped = true;
        self.available.notify_all();
    }
}

/// A set of named in-memory queues created on first use.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the queue with this name, creating it if needed.
    pub fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name)))
            .clone()
    }
}

impl ConsumerFactory for MemoryBroker {
    fn create(&self, queue: &str) -> Result<Arc<dyn Consumer>, QueueError> {
        Ok(self.queue(queue))
    }
}

impl Publisher for MemoryBroker {
    fn publish(&self, queue: &str, body: &[u8]) -> Result<MessageId, QueueError> {
        Ok(self.queue(queue).push(body))
    }
}
