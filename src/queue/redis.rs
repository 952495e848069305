//! Redis-backed queue with reliable fetch.
//!
//! # Queue Structure
//!
//! Each queue uses three Redis lists:
//!
//! - `{queue}`: main list; producers `LPUSH`, consumers pop from the right
//! - `{queue}:processing`: messages leased by a consumer (for crash recovery)
//! - `{queue}:dead_letter`: envelopes that could not be parsed
//!
//! # Reliability
//!
//! `fetch` uses BRPOPLPUSH to atomically move a message into the processing
//! list. A message this consumer leased and never completed or rejected is
//! put back on the main list once it has been leased for longer than the
//! visibility timeout; the check runs from `fetch`. Entries stranded by a
//! previous process are moved back by [`RedisQueue::recover`] when a consumer
//! is created.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redis::Commands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{base64_body, Consumer, ConsumerFactory, Message, MessageId, Publisher};
use crate::error::QueueError;

/// Serialized form of a message stored in a Redis list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: MessageId,
    #[serde(with = "base64_body")]
    body: Vec<u8>,
    enqueued_at: DateTime<Utc>,
}

impl Envelope {
    fn new(body: &[u8]) -> Self {
        Self {
            id: MessageId::new(Uuid::new_v4().to_string()),
            body: body.to_vec(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Default for [`RedisQueue::with_visibility_timeout`].
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Moves an entry from the processing list back to the main list only if it
/// is still there, so a concurrent `recover` cannot make it appear twice.
const REQUEUE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) > 0 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

struct Lease {
    data: String,
    leased_at: Instant,
}

/// Raw list entries of leased messages, needed for LREM, with the time each
/// was leased.
#[derive(Default)]
struct Leases {
    entries: HashMap<MessageId, Lease>,
}

impl Leases {
    fn insert(&mut self, id: MessageId, data: String, now: Instant) {
        self.entries.insert(id, Lease { data, leased_at: now });
    }

    fn take(&mut self, id: &MessageId) -> Option<String> {
        self.entries.remove(id).map(|lease| lease.data)
    }

    /// Removes and returns every lease held for at least `timeout`.
    fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<(MessageId, String)> {
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, lease)| now.saturating_duration_since(lease.leased_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.take(&id).map(|data| (id, data)))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Interval between lease expiry sweeps.
fn sweep_interval(visibility_timeout: Duration) -> Duration {
    (visibility_timeout / 4).clamp(Duration::from_millis(100), Duration::from_secs(30))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn connect(client: &redis::Client) -> Result<redis::Connection, QueueError> {
    client
        .get_connection()
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
}

/// A consumer for one Redis list.
pub struct RedisQueue {
    queue_name: String,
    processing_queue: String,
    dead_letter_queue: String,
    /// Held across blocking BRPOPLPUSH calls.
    fetch_conn: Mutex<redis::Connection>,
    /// Used for acknowledgements so they never wait behind a blocked fetch.
    ack_conn: Mutex<redis::Connection>,
    in_flight: Mutex<Leases>,
    visibility_timeout: Duration,
    last_sweep: Mutex<Instant>,
    stopped: AtomicBool,
}

impl RedisQueue {
    /// Connects to Redis and creates a consumer for `queue_name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Self::from_client(&client, queue_name)
    }

    fn from_client(client: &redis::Client, queue_name: &str) -> Result<Self, QueueError> {
        Ok(Self {
            queue_name: queue_name.to_string(),
            processing_queue: processing_key(queue_name),
            dead_letter_queue: dead_letter_key(queue_name),
            fetch_conn: Mutex::new(connect(client)?),
            ack_conn: Mutex::new(connect(client)?),
            in_flight: Mutex::new(Leases::default()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            last_sweep: Mutex::new(Instant::now()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Sets how long a message may stay leased without an ack before it is
    /// put back on the main list.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Puts every message this consumer has leased for longer than the
    /// visibility timeout back on the main list.
    ///
    /// Returns the number of messages requeued.
    pub fn requeue_expired(&self) -> Result<usize, QueueError> {
        let expired = lock(&self.in_flight).take_expired(Instant::now(), self.visibility_timeout);
        if expired.is_empty() {
            return Ok(0);
        }

        let script = redis::Script::new(REQUEUE_SCRIPT);
        let mut conn = lock(&self.ack_conn);
        let mut requeued = 0;
        for (id, data) in expired {
            let moved: i64 = script
                .key(&self.processing_queue)
                .key(&self.queue_name)
                .arg(&data)
                .invoke(&mut *conn)?;
            if moved > 0 {
                debug!(queue = %self.queue_name, message_id = %id, "Lease expired; requeued message");
                requeued += 1;
            }
        }

        if requeued > 0 {
            info!(queue = %self.queue_name, requeued, "Requeued messages past their visibility timeout");
        }
        Ok(requeued)
    }

    /// Number of messages leased by this consumer and not yet settled.
    pub fn leased_len(&self) -> usize {
        lock(&self.in_flight).len()
    }

    fn sweep_if_due(&self) {
        {
            let mut last_sweep = lock(&self.last_sweep);
            if last_sweep.elapsed() < sweep_interval(self.visibility_timeout) {
                return;
            }
            *last_sweep = Instant::now();
        }
        if let Err(e) = self.requeue_expired() {
            warn!(queue = %self.queue_name, error = %e, "Failed to requeue expired leases");
        }
    }

    /// Moves every entry in the processing list back onto the main list.
    ///
    /// Returns the number of messages recovered.
    pub fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = lock(&self.ack_conn);
        let stranded: Vec<String> = conn.lrange(&self.processing_queue, 0, -1)?;
        let mut recovered = 0;

        for data in stranded {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&self.processing_queue, 1, &data)
                .rpush(&self.queue_name, &data);
            pipe.query::<()>(&mut *conn)?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(queue = %self.queue_name, recovered, "Recovered messages from processing list");
        }

        Ok(recovered)
    }

    /// Returns the number of messages waiting in the main list.
    pub fn len(&self) -> Result<usize, QueueError> {
        let mut conn = lock(&self.ack_conn);
        let len: usize = conn.llen(&self.queue_name)?;
        Ok(len)
    }

    /// Returns whether the main list is empty.
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Returns the number of leased messages.
    pub fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = lock(&self.ack_conn);
        let len: usize = conn.llen(&self.processing_queue)?;
        Ok(len)
    }

    fn take_in_flight(&self, id: &MessageId) -> Result<String, QueueError> {
        lock(&self.in_flight)
            .take(id)
            .ok_or_else(|| QueueError::NotInFlight(id.to_string()))
    }

    fn dead_letter(&self, data: &str) -> Result<(), QueueError> {
        let mut conn = lock(&self.ack_conn);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.processing_queue, 1, data)
            .lpush(&self.dead_letter_queue, data);
        pipe.query::<()>(&mut *conn)?;
        Ok(())
    }
}

impl Consumer for RedisQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn fetch(&self, timeout: Duration) -> Result<Option<Message>, QueueError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.sweep_if_due();

        let timeout_secs = timeout.as_secs().max(1) as usize;
        let result: Option<String> = {
            let mut conn = lock(&self.fetch_conn);
            redis::cmd("BRPOPLPUSH")
                .arg(&self.queue_name)
                .arg(&self.processing_queue)
                .arg(timeout_secs)
                .query(&mut *conn)?
        };

        let Some(data) = result else {
            return Ok(None);
        };

        match serde_json::from_str::<Envelope>(&data) {
            Ok(envelope) => {
                lock(&self.in_flight).insert(envelope.id.clone(), data, Instant::now());
                Ok(Some(Message::new(envelope.id, envelope.body)))
            }
            Err(e) => {
                warn!(queue = %self.queue_name, error = %e, "Moving malformed envelope to dead letter list");
                self.dead_letter(&data)?;
                Err(QueueError::MalformedEnvelope {
                    queue: self.queue_name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn complete(&self, id: &MessageId) -> Result<(), QueueError> {
        let data = self.take_in_flight(id)?;
        let mut conn = lock(&self.ack_conn);
        conn.lrem::<_, _, ()>(&self.processing_queue, 1, &data)?;
        Ok(())
    }

    fn reject(&self, id: &MessageId) -> Result<(), QueueError> {
        let data = self.take_in_flight(id)?;
        let mut conn = lock(&self.ack_conn);

        // RPUSH puts the message at the popping end for immediate redelivery
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&self.processing_queue, 1, &data)
            .rpush(&self.queue_name, &data);
        pipe.query::<()>(&mut *conn)?;
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Creates [`RedisQueue`] consumers and publishes envelopes.
pub struct RedisBroker {
    client: redis::Client,
    publish_conn: Mutex<redis::Connection>,
    recover_on_create: bool,
    visibility_timeout: Duration,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let publish_conn = Mutex::new(connect(&client)?);
        Ok(Self {
            client,
            publish_conn,
            recover_on_create: true,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        })
    }

    /// Whether consumers recover their processing list when created.
    pub fn with_recovery(mut self, recover: bool) -> Self {
        self.recover_on_create = recover;
        self
    }

    /// Visibility timeout given to every consumer this broker creates.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

impl ConsumerFactory for RedisBroker {
    fn create(&self, queue: &str) -> Result<Arc<dyn Consumer>, QueueError> {
        let consumer = RedisQueue::from_client(&self.client, queue)?
            .with_visibility_timeout(self.visibility_timeout);
        if self.recover_on_create {
            consumer.recover()?;
        }
        Ok(Arc::new(consumer))
    }
}

impl Publisher for RedisBroker {
    fn publish(&self, queue: &str, body: &[u8]) -> Result<MessageId, QueueError> {
        let envelope = Envelope::new(body);
        let serialized = serde_json::to_string(&envelope)?;
        let mut conn = lock(&self.publish_conn);
        conn.lpush::<_, _, ()>(queue, serialized)?;
        Ok(envelope.id)
    }
}

fn processing_key(queue: &str) -> String {
    format!("{}:processing", queue)
}

fn dead_letter_key(queue: &str) -> String {
    format!("{}:dead_letter", queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(processing_key("mail"), "mail:processing");
        assert_eq!(dead_letter_key("mail"), "mail:dead_letter");
    }

    #[test]
    fn test_envelope_body_is_base64() {
        let envelope = Envelope::new(b"\x00\xffjob");
        let json = serde_json::to_value(&envelope).expect("envelope should serialize");

        assert_eq!(json["body"], "AP9qb2I=");
        assert!(json.get("enqueued_at").is_some());

        let parsed: Envelope = serde_json::from_value(json).expect("envelope should parse");
        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.body, b"\x00\xffjob");
    }

    #[test]
    fn test_envelope_rejects_invalid_base64() {
        let raw = r#"{"id":"x","body":"***","enqueued_at":"2024-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn test_leases_expire_after_visibility_timeout() {
        let start = Instant::now();
        let mut leases = Leases::default();
        leases.insert(MessageId::new("old"), "old-data".into(), start);
        leases.insert(
            MessageId::new("new"),
            "new-data".into(),
            start + Duration::from_secs(50),
        );

        let timeout = Duration::from_secs(60);
        assert!(leases.take_expired(start + Duration::from_secs(59), timeout).is_empty());

        let expired = leases.take_expired(start + Duration::from_secs(60), timeout);
        assert_eq!(expired, vec![(MessageId::new("old"), "old-data".to_string())]);
        assert_eq!(leases.len(), 1);

        // An expired lease can no longer be settled through this consumer.
        assert!(leases.take(&MessageId::new("old")).is_none());
        assert_eq!(leases.take(&MessageId::new("new")).as_deref(), Some("new-data"));
    }

    #[test]
    fn test_sweep_interval_is_bounded() {
        assert_eq!(sweep_interval(Duration::from_secs(300)), Duration::from_secs(30));
        assert_eq!(sweep_interval(Duration::from_secs(8)), Duration::from_secs(2));
        assert_eq!(sweep_interval(Duration::from_millis(10)), Duration::from_millis(100));
    }

    #[test]
    fn test_connect_invalid_url() {
        let result = RedisBroker::connect("not-a-url");
        assert!(matches!(result, Err(QueueError::ConnectionFailed(_))));
    }

    #[test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    fn test_live_publish_fetch_reject_complete() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let queue_name = format!("jobforge-test-{}", Uuid::new_v4());
        let broker = RedisBroker::connect(&url).unwrap();
        let consumer = broker.create(&queue_name).unwrap();

        let id = broker.publish(&queue_name, b"payload").unwrap();
        let message = consumer.fetch(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(message.id, id);

        consumer.reject(&id).unwrap();
        let again = consumer.fetch(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(again.id, id);

        consumer.complete(&id).unwrap();
        assert!(consumer.fetch(Duration::from_secs(1)).unwrap().is_none());
    }

    #[test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    fn test_live_unacked_message_is_redelivered_after_visibility_timeout() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let queue_name = format!("jobforge-test-{}", Uuid::new_v4());
        let broker = RedisBroker::connect(&url)
            .unwrap()
            .with_visibility_timeout(Duration::from_millis(200));
        let consumer = RedisQueue::connect(&url, &queue_name)
            .unwrap()
            .with_visibility_timeout(Duration::from_millis(200));

        let id = broker.publish(&queue_name, b"payload").unwrap();
        let message = consumer.fetch(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(message.id, id);
        consumer.release(&id);
        assert_eq!(consumer.processing_len().unwrap(), 1);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(consumer.requeue_expired().unwrap(), 1);
        assert_eq!(consumer.leased_len(), 0);
        assert_eq!(consumer.processing_len().unwrap(), 0);

        let again = consumer.fetch(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(again.id, id);
        consumer.complete(&id).unwrap();
        assert_eq!(consumer.processing_len().unwrap(), 0);
    }
}
