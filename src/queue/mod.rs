//! Queue backend contract and the unit of work threaded through the pipeline.
//!
//! A backend exposes four operations to the core:
//!
//! - `fetch`: lease the next message (blocking up to a bound)
//! - `complete`: acknowledge and delete a leased message
//! - `reject`: return a leased message to the queue for immediate redelivery
//! - `stop`: cooperatively interrupt a blocked fetch
//! - `release`: note that a leased message was left unacknowledged
//!
//! Messages that are neither completed nor rejected stay leased and are
//! redelivered by the backend's own visibility or recovery mechanism.
//!
//! # Backends
//!
//! - [`MemoryQueue`]: in-process queue used for tests and local runs
//! - [`RedisQueue`]: Redis lists with a processing list for crash recovery

pub mod dedup;
pub mod memory;
pub mod redis;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::pool::ipc::WireUnit;

pub use dedup::{Deduplicated, DuplicateDetector, MemoryDuplicateDetector, NoDuplicateDetection};
pub use memory::{MemoryBroker, MemoryQueue};
pub use self::redis::{RedisBroker, RedisQueue};

/// Opaque, backend-assigned message handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A message as decoded from a backend's native format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

/// A consumer of a single named queue.
///
/// Implementations are shared between the fetch thread that owns the queue
/// and the master event loop that acknowledges results, so every method
/// takes `&self`.
pub trait Consumer: Send + Sync {
    /// Name of the queue this consumer reads from.
    fn queue_name(&self) -> &str;

    /// Leases the next message, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the wait expires or the consumer was stopped.
    fn fetch(&self, timeout: Duration) -> Result<Option<Message>, QueueError>;

    /// Acknowledges a leased message, removing it from the queue.
    fn complete(&self, id: &MessageId) -> Result<(), QueueError>;

    /// Returns a leased message to the queue for immediate redelivery.
    fn reject(&self, id: &MessageId) -> Result<(), QueueError>;

    /// Interrupts a blocked `fetch`. Subsequent fetches return `Ok(None)`.
    fn stop(&self);

    /// Called when a leased message is left unacknowledged. The lease is
    /// kept; the backend redelivers the message on its own schedule.
    fn release(&self, _id: &MessageId) {}
}

/// Creates a consumer per configured queue name.
pub trait ConsumerFactory: Send + Sync {
    fn create(&self, queue: &str) -> Result<Arc<dyn Consumer>, QueueError>;
}

impl<F> ConsumerFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Consumer>, QueueError> + Send + Sync,
{
    fn create(&self, queue: &str) -> Result<Arc<dyn Consumer>, QueueError> {
        self(queue)
    }
}

/// Producer side of a queue backend.
pub trait Publisher: Send + Sync {
    /// Appends an encoded payload to `queue` and returns its message id.
    fn publish(&self, queue: &str, body: &[u8]) -> Result<MessageId, QueueError>;
}

/// Terminal disposition of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Acknowledge: remove the message from its queue.
    Ack,
    /// Explicit reject: return the message for immediate redelivery.
    Reject,
    /// Leave the message leased for backend-level redelivery.
    NoAck,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Disposition::Ack => "ack",
            Disposition::Reject => "reject",
            Disposition::NoAck => "no_ack",
        };
        f.write_str(s)
    }
}

/// A fetched message bound to the consumer that leased it.
///
/// A unit is moved through the pipeline and consumed by exactly one of
/// [`complete`](Self::complete), [`reject`](Self::reject) or
/// [`abandon`](Self::abandon). It is deliberately not `Clone`.
pub struct UnitOfWork {
    id: MessageId,
    body: Vec<u8>,
    source: Arc<dyn Consumer>,
}

impl UnitOfWork {
    pub fn new(id: MessageId, body: Vec<u8>, source: Arc<dyn Consumer>) -> Self {
        Self { id, body, source }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Name of the queue the unit was fetched from.
    pub fn queue_name(&self) -> &str {
        self.source.queue_name()
    }

    /// Wire representation sent to a worker process.
    pub fn to_wire(&self) -> WireUnit {
        WireUnit {
            id: self.id.clone(),
            queue_name: self.queue_name().to_string(),
            body: self.body.clone(),
        }
    }

    /// Acknowledges the message on its originating consumer.
    pub fn complete(self) -> Result<(), QueueError> {
        self.source.complete(&self.id)
    }

    /// Rejects the message on its originating consumer.
    pub fn reject(self) -> Result<(), QueueError> {
        self.source.reject(&self.id)
    }

    /// Drops the unit without acknowledgement; the backend redelivers it.
    pub fn abandon(self) {
        self.source.release(&self.id);
        debug!(
            queue = %self.queue_name(),
            message_id = %self.id,
            "Leaving message unacknowledged"
        );
    }

    /// Applies a disposition, logging backend failures instead of returning them.
    ///
    /// Returns `true` when the backend accepted the disposition.
    pub fn settle(self, disposition: Disposition) -> bool {
        let queue = self.queue_name().to_string();
        let id = self.id.clone();
        let result = match disposition {
            Disposition::Ack => self.complete(),
            Disposition::Reject => self.reject(),
            Disposition::NoAck => {
                self.abandon();
                Ok(())
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    queue = %queue,
                    message_id = %id,
                    disposition = %disposition,
                    error = %e,
                    "Failed to settle message"
                );
                false
            }
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("queue", &self.queue_name())
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Serde adapter storing raw bytes as a base64 string.
pub(crate) mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_on(queue: &Arc<MemoryQueue>, body: &str) -> UnitOfWork {
        let id = queue.push(body.as_bytes());
        let message = queue
            .fetch(Duration::from_millis(10))
            .expect("fetch should succeed")
            .expect("message should be available");
        assert_eq!(message.id, id);
        UnitOfWork::new(message.id, message.body, queue.clone())
    }

    #[test]
    fn test_message_id_display() {
        let id = MessageId::new("abc-123");
        assert_eq!(id.to_string(), "abc-123");
        assert_eq!(id.as_str(), "abc-123");
        assert_eq!(MessageId::from("abc-123"), id);
    }

    #[test]
    fn test_unit_complete_acks_on_source() {
        let queue = Arc::new(MemoryQueue::new("mail"));
        let unit = unit_on(&queue, "payload");
        let id = unit.id().clone();

        assert_eq!(unit.queue_name(), "mail");
        assert!(unit.settle(Disposition::Ack));
        assert_eq!(queue.completed(), vec![id]);
        assert!(queue.rejected().is_empty());
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[test]
    fn test_unit_reject_returns_to_queue() {
        let queue = Arc::new(MemoryQueue::new("mail"));
        let unit = unit_on(&queue, "payload");
        let id = unit.id().clone();

        unit.reject().expect("reject should succeed");
        assert_eq!(queue.rejected(), vec![id]);
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn test_unit_abandon_leaves_message_leased() {
        let queue = Arc::new(MemoryQueue::new("mail"));
        let unit = unit_on(&queue, "payload");

        assert!(unit.settle(Disposition::NoAck));
        assert!(queue.completed().is_empty());
        assert!(queue.rejected().is_empty());
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[test]
    fn test_unit_to_wire() {
        let queue = Arc::new(MemoryQueue::new("reports"));
        let unit = unit_on(&queue, "{\"class\":\"Echo\"}");
        let wire = unit.to_wire();

        assert_eq!(&wire.id, unit.id());
        assert_eq!(wire.queue_name, "reports");
        assert_eq!(wire.body, unit.body());
    }

    #[test]
    fn test_settle_reports_backend_failure() {
        let queue = Arc::new(MemoryQueue::new("mail"));
        let unit = UnitOfWork::new(MessageId::new("never-fetched"), Vec::new(), queue.clone());

        assert!(!unit.settle(Disposition::Ack));
    }

    #[test]
    fn test_disposition_display() {
        assert_eq!(Disposition::Ack.to_string(), "ack");
        assert_eq!(Disposition::Reject.to_string(), "reject");
        assert_eq!(Disposition::NoAck.to_string(), "no_ack");
    }
}
