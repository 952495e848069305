//! Error types for jobforge operations.
//!
//! Defines the error types shared across subsystems:
//! - Queue backend interactions (fetch, ack, reject, publish)
//! - Payload encoding and decoding
//! - Job execution results reported by job code
//! - Lifecycle hook failures
//!
//! Subsystem-local errors (`ConfigError`, `PoolError`, `IpcError`) live next
//! to the code that raises them.

use thiserror::Error;

/// Errors that can occur while talking to a queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the backend.
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a message envelope.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The message is not currently leased by this consumer.
    #[error("Message {0} is not in flight")]
    NotInFlight(String),

    /// A message envelope could not be parsed.
    #[error("Malformed message envelope on queue '{queue}': {reason}")]
    MalformedEnvelope { queue: String, reason: String },

    /// No queue with this name is known to the backend.
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    /// A consumer thread could not be started.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by an [`Encoder`](crate::job::Encoder).
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The payload could not be decoded into a job descriptor.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The job descriptor could not be encoded.
    #[error("Failed to encode job: {0}")]
    Encode(String),
}

/// Error returned from a job's `perform` entry point.
///
/// `Rejected` asks for the message to be returned to its queue immediately;
/// `Failed` leaves it unacknowledged so the queue redelivers it on its own
/// schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("Message rejected: {0}")]
    Rejected(String),
}

impl JobError {
    /// Creates a failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Creates an explicit rejection with the given reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Returns whether this error is an explicit rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(self, JobError::Rejected(_))
    }
}

/// Error returned by a lifecycle hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Hook failed: {0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
