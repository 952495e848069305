//! Job definitions and the registry that maps class names to code.
//!
//! - [`JobDescriptor`]: what travels in a message body (class name + args)
//! - [`Job`]: the `perform` entry point implemented by job code
//! - [`JobRegistry`]: class name to job, its [`JobOptions`] and the encoder
//! - [`HookRegistry`]: lifecycle hooks run around execution

pub mod encoder;
pub mod hooks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::error::{EncodeError, JobError, QueueError};
use crate::queue::{MessageId, Publisher};

pub use encoder::{Encoder, JsonEncoder};
pub use hooks::{Hook, HookContext, HookFailure, HookKind, HookRegistry};

/// Per-message options carried alongside the arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorOptions {
    /// Timeout in seconds, overriding the registered job's timeout.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// Queue the message is published to, overriding the registered queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
}

/// A decoded job invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub options: DescriptorOptions,
}

impl JobDescriptor {
    pub fn new(class_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class_name: class_name.into(),
            args,
            options: DescriptorOptions::default(),
        }
    }

    /// Sets a per-message timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// Sets the destination queue.
    pub fn with_queue_name(mut self, queue: impl Into<String>) -> Self {
        self.options.queue_name = Some(queue.into());
        self
    }

    /// Per-message timeout, if one was given and is positive.
    pub fn timeout(&self) -> Option<Duration> {
        self.options
            .timeout_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Configuration declared by a job class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Queue the job is published to by default.
    pub queue_name: String,
    /// Execution deadline. `None` means no limit.
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Job code invoked by a worker process.
///
/// `perform` runs on a blocking thread. Returning [`JobError::Rejected`]
/// requests immediate redelivery; any other error leaves the message for
/// the backend to redeliver. A panic is treated as a failure.
pub trait Job: Send + Sync {
    fn perform(&self, args: &[Value]) -> Result<(), JobError>;
}

impl<F> Job for F
where
    F: Fn(&[Value]) -> Result<(), JobError> + Send + Sync,
{
    fn perform(&self, args: &[Value]) -> Result<(), JobError> {
        self(args)
    }
}

/// A job class registered under a name.
#[derive(Clone)]
pub struct RegisteredJob {
    pub class_name: String,
    pub options: JobOptions,
    pub job: Arc<dyn Job>,
}

impl std::fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("class_name", &self.class_name)
            .field("options", &self.options)
            .finish()
    }
}

/// Errors that can occur while publishing a job.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Unknown job class '{0}'")]
    UnknownJob(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Maps job class names to their implementation and options.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, RegisteredJob>,
    encoder: Arc<dyn Encoder>,
    queue_prefix: Option<String>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Creates an empty registry using the JSON encoder.
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            encoder: Arc::new(JsonEncoder),
            queue_prefix: None,
        }
    }

    /// Replaces the payload encoder.
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Prefix applied to queue names when publishing.
    pub fn with_queue_prefix(mut self, prefix: Option<String>) -> Self {
        self.queue_prefix = prefix;
        self
    }

    /// Registers a job class, replacing any previous registration.
    pub fn register(
        &mut self,
        class_name: impl Into<String>,
        options: JobOptions,
        job: impl Job + 'static,
    ) -> &mut Self {
        let class_name = class_name.into();
        debug!(class = %class_name, queue = %options.queue_name, "Registering job");
        self.jobs.insert(
            class_name.clone(),
            RegisteredJob {
                class_name,
                options,
                job: Arc::new(job),
            },
        );
        self
    }

    pub fn get(&self, class_name: &str) -> Option<&RegisteredJob> {
        self.jobs.get(class_name)
    }

    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Distinct queue names declared by registered jobs, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .jobs
            .values()
            .map(|j| j.options.queue_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Encodes `job` and pushes it to its queue.
    ///
    /// The destination is the descriptor's queue if set, otherwise the queue
    /// the class was registered with; the prefix is applied to either.
    pub fn publish(
        &self,
        publisher: &dyn Publisher,
        job: &JobDescriptor,
    ) -> Result<MessageId, PublishError> {
        let registered = self
            .get(&job.class_name)
            .ok_or_else(|| PublishError::UnknownJob(job.class_name.clone()))?;

        let queue = job
            .options
            .queue_name
            .as_deref()
            .unwrap_or(&registered.options.queue_name);
        let queue = match &self.queue_prefix {
            Some(prefix) => format!("{}_{}", prefix, queue),
            None => queue.to_string(),
        };

        let body = self.encoder.encode(job)?;
        let id = publisher.publish(&queue, &body)?;
        debug!(class = %job.class_name, queue = %queue, message_id = %id, "Published job");
        Ok(id)
    }
}
