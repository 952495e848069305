//! Lifecycle hooks.
//!
//! Hooks are registered per [`HookKind`] and run in registration order.
//! A failing or panicking hook is logged and skipped; the remaining hooks
//! of that kind still run and the job's outcome is reported regardless.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use super::JobDescriptor;
use crate::error::HookError;
use crate::queue::MessageId;

/// Extension points in the job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Run once by the master before the first worker is spawned.
    BeforeFirstFork,
    BeforePerform,
    AfterPerform,
    OnSuccess,
    OnFailure,
    OnTimeout,
}

impl HookKind {
    pub const ALL: [HookKind; 6] = [
        HookKind::BeforeFirstFork,
        HookKind::BeforePerform,
        HookKind::AfterPerform,
        HookKind::OnSuccess,
        HookKind::OnFailure,
        HookKind::OnTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::BeforeFirstFork => "before_first_fork",
            HookKind::BeforePerform => "before_perform",
            HookKind::AfterPerform => "after_perform",
            HookKind::OnSuccess => "on_success",
            HookKind::OnFailure => "on_failure",
            HookKind::OnTimeout => "on_timeout",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why `on_failure` hooks are running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookFailure {
    /// The body could not be decoded; the raw body is in [`HookContext::body`].
    MalformedPayload(String),
    /// The job returned an error, panicked or is not registered.
    Error(String),
    /// The job explicitly rejected the message.
    Rejected(String),
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookFailure::MalformedPayload(e) => write!(f, "malformed payload: {}", e),
            HookFailure::Error(e) => write!(f, "{}", e),
            HookFailure::Rejected(e) => write!(f, "rejected: {}", e),
        }
    }
}

/// What a hook is told about the job it runs for.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// Decoded descriptor; `None` when decoding failed or for `before_first_fork`.
    pub job: Option<&'a JobDescriptor>,
    /// Raw message body.
    pub body: &'a [u8],
    pub message_id: Option<&'a MessageId>,
    pub queue_name: &'a str,
    /// Set for `on_failure` hooks.
    pub failure: Option<&'a HookFailure>,
}

impl<'a> HookContext<'a> {
    /// Context for hooks that do not run on behalf of a message.
    pub fn global() -> Self {
        Self {
            job: None,
            body: &[],
            message_id: None,
            queue_name: "",
            failure: None,
        }
    }
}

/// A registered hook callable.
pub type Hook = Arc<dyn Fn(&HookContext<'_>) -> Result<(), HookError> + Send + Sync>;

/// Ordered hook lists keyed by kind.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<HookKind, Vec<Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook to the list for `kind`.
    pub fn add<F>(&mut self, kind: HookKind, hook: F) -> &mut Self
    where
        F: Fn(&HookContext<'_>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.hooks.entry(kind).or_default().push(Arc::new(hook));
        self
    }

    pub fn hooks_for(&self, kind: HookKind) -> &[Hook] {
        self.hooks.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every hook of `kind` in order and returns how many failed.
    pub fn run(&self, kind: HookKind, ctx: &HookContext<'_>) -> usize {
        let mut failures = 0;

        for (index, hook) in self.hooks_for(kind).iter().enumerate() {
            let error = match catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("hook panicked: {}", panic_message(&*panic)),
            };

            failures += 1;
            warn!(
                hook = %kind,
                index,
                queue = %ctx.queue_name,
                message_id = ctx.message_id.map(|id| id.as_str()).unwrap_or("-"),
                error = %error,
                "Hook failed"
            );
        }

        failures
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&'static str, usize> = self
            .hooks
            .iter()
            .map(|(kind, hooks)| (kind.as_str(), hooks.len()))
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
