//! Worker-side job execution.
//!
//! For each unit: decode the body, run `before_perform` hooks, run the job
//! on a blocking thread under its deadline, run the outcome's hooks, and emit
//! exactly one "finished" event.
//!
//! | Outcome   | Hooks after `before_perform`   | Disposition |
//! |-----------|--------------------------------|-------------|
//! | Completed | `after_perform`, `on_success`  | ack         |
//! | Rejected  | `on_failure` (rejected)        | reject      |
//! | Failed    | `on_failure`                   | no ack      |
//! | TimedOut  | `on_timeout`                   | no ack      |
//!
//! A malformed body skips `before_perform` and only runs `on_failure`.
//!
//! Deadlines are advisory. When one expires the engine stops waiting and
//! reports `TimedOut`, but the blocking thread keeps running the job until
//! it returns on its own. [`ExecutionEngine::lingering`] counts such jobs.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::error::JobError;
use crate::job::hooks::panic_message;
use crate::job::{HookContext, HookFailure, HookKind, HookRegistry, JobDescriptor, JobRegistry};
use crate::pool::ipc::{UnitResult, WireUnit};
use crate::queue::{Disposition, MessageId};

/// Result of running one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(String),
    TimedOut,
    Rejected(String),
}

impl ExecutionOutcome {
    pub fn state(&self) -> FinishedState {
        match self {
            ExecutionOutcome::Completed => FinishedState::Completed,
            ExecutionOutcome::Failed(_) => FinishedState::Failed,
            ExecutionOutcome::TimedOut => FinishedState::TimedOut,
            ExecutionOutcome::Rejected(_) => FinishedState::Rejected,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ExecutionOutcome::Completed => Disposition::Ack,
            ExecutionOutcome::Rejected(_) => Disposition::Reject,
            ExecutionOutcome::Failed(_) | ExecutionOutcome::TimedOut => Disposition::NoAck,
        }
    }
}

/// The `state` tag of a "finished" event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedState {
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
    Rejected,
}

impl FinishedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishedState::Completed => "completed",
            FinishedState::Failed => "failed",
            FinishedState::TimedOut => "timeout",
            FinishedState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for FinishedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted once per executed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedEvent {
    pub state: FinishedState,
    /// Queue the unit was fetched from.
    pub queue_name: String,
    pub message_id: MessageId,
    /// `None` when the body could not be decoded.
    pub class_name: Option<String>,
    pub duration: Duration,
}

/// Receives every [`FinishedEvent`].
pub trait FinishedListener: Send + Sync {
    fn on_finished(&self, event: &FinishedEvent);
}

/// Logs each finished event as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl FinishedListener for TracingListener {
    fn on_finished(&self, event: &FinishedEvent) {
        info!(
            event = "finished",
            state = event.state.as_str(),
            queue = %event.queue_name,
            message_id = %event.message_id,
            class = event.class_name.as_deref().unwrap_or("-"),
            duration_ms = event.duration.as_millis() as u64,
            "Job finished"
        );
    }
}

/// What the engine did with one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub id: MessageId,
    pub queue_name: String,
    pub class_name: Option<String>,
    pub outcome: ExecutionOutcome,
    pub duration: Duration,
}

impl ExecutionReport {
    pub fn disposition(&self) -> Disposition {
        self.outcome.disposition()
    }

    /// The result line sent back to the master.
    pub fn to_result(&self) -> UnitResult {
        UnitResult {
            id: self.id.clone(),
            state: self.outcome.state(),
            disposition: self.disposition(),
            duration_ms: self.duration.as_millis() as u64,
            class_name: self.class_name.clone(),
        }
    }
}

/// Decrements the running-job count when the blocking call returns.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs units of work for one worker process.
pub struct ExecutionEngine {
    registry: Arc<JobRegistry>,
    hooks: Arc<HookRegistry>,
    listeners: Vec<Arc<dyn FinishedListener>>,
    running: Arc<AtomicUsize>,
}

impl ExecutionEngine {
    /// Creates an engine that logs finished events through `tracing`.
    pub fn new(registry: Arc<JobRegistry>, hooks: Arc<HookRegistry>) -> Self {
        Self {
            registry,
            hooks,
            listeners: vec![Arc::new(TracingListener)],
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn FinishedListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Number of job calls still running on blocking threads, including
    /// calls the engine already reported as timed out.
    pub fn lingering(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Executes one unit. Never fails: every error is classified into the
    /// report's outcome.
    pub async fn execute(&self, unit: &WireUnit) -> ExecutionReport {
        let start = Instant::now();

        let descriptor = match self.registry.encoder().decode(&unit.body) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(
                    queue = %unit.queue_name,
                    message_id = %unit.id,
                    state = FinishedState::Failed.as_str(),
                    error = %e,
                    "Malformed payload"
                );
                let failure = HookFailure::MalformedPayload(e.to_string());
                self.hooks.run(
                    HookKind::OnFailure,
                    &HookContext {
                        job: None,
                        body: &unit.body,
                        message_id: Some(&unit.id),
                        queue_name: &unit.queue_name,
                        failure: Some(&failure),
                    },
                );
                return self.finish(unit, None, ExecutionOutcome::Failed(e.to_string()), start);
            }
        };

        let ctx = HookContext {
            job: Some(&descriptor),
            body: &unit.body,
            message_id: Some(&unit.id),
            queue_name: &unit.queue_name,
            failure: None,
        };

        let outcome = match self.registry.get(&descriptor.class_name) {
            Some(registered) => {
                let limit = descriptor.timeout().or(registered.options.timeout);
                self.hooks.run(HookKind::BeforePerform, &ctx);
                self.perform(registered.job.clone(), &descriptor, limit).await
            }
            None => ExecutionOutcome::Failed(format!(
                "unknown job class '{}'",
                descriptor.class_name
            )),
        };

        match &outcome {
            ExecutionOutcome::Completed => {
                self.hooks.run(HookKind::AfterPerform, &ctx);
                self.hooks.run(HookKind::OnSuccess, &ctx);
            }
            ExecutionOutcome::Rejected(reason) => {
                warn!(
                    queue = %unit.queue_name,
                    message_id = %unit.id,
                    class = %descriptor.class_name,
                    state = FinishedState::Rejected.as_str(),
                    reason = %reason,
                    "Job rejected message"
                );
                let failure = HookFailure::Rejected(reason.clone());
                self.hooks.run(
                    HookKind::OnFailure,
                    &HookContext {
                        failure: Some(&failure),
                        ..ctx
                    },
                );
            }
            ExecutionOutcome::Failed(e) => {
                error!(
                    queue = %unit.queue_name,
                    message_id = %unit.id,
                    class = %descriptor.class_name,
                    state = FinishedState::Failed.as_str(),
                    error = %e,
                    "Job failed"
                );
                let failure = HookFailure::Error(e.clone());
                self.hooks.run(
                    HookKind::OnFailure,
                    &HookContext {
                        failure: Some(&failure),
                        ..ctx
                    },
                );
            }
            ExecutionOutcome::TimedOut => {
                warn!(
                    queue = %unit.queue_name,
                    message_id = %unit.id,
                    class = %descriptor.class_name,
                    state = FinishedState::TimedOut.as_str(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Job timed out; it may still be running"
                );
                self.hooks.run(HookKind::OnTimeout, &ctx);
            }
        }

        let class_name = Some(descriptor.class_name.clone());
        self.finish(unit, class_name, outcome, start)
    }

    async fn perform(
        &self,
        job: Arc<dyn crate::job::Job>,
        descriptor: &JobDescriptor,
        limit: Option<Duration>,
    ) -> ExecutionOutcome {
        let args = descriptor.args.clone();
        self.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(self.running.clone());
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            job.perform(&args)
        });

        match limit {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => classify(joined),
                Err(_) => ExecutionOutcome::TimedOut,
            },
            None => classify(task.await),
        }
    }

    fn finish(
        &self,
        unit: &WireUnit,
        class_name: Option<String>,
        outcome: ExecutionOutcome,
        start: Instant,
    ) -> ExecutionReport {
        let report = ExecutionReport {
            id: unit.id.clone(),
            queue_name: unit.queue_name.clone(),
            class_name,
            outcome,
            duration: start.elapsed(),
        };

        let event = FinishedEvent {
            state: report.outcome.state(),
            queue_name: report.queue_name.clone(),
            message_id: report.id.clone(),
            class_name: report.class_name.clone(),
            duration: report.duration,
        };
        for listener in &self.listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener.on_finished(&event))) {
                warn!(
                    message_id = %event.message_id,
                    error = %panic_message(&*panic),
                    "Finished listener panicked"
                );
            }
        }
        report
    }
}

fn classify(joined: Result<Result<(), JobError>, JoinError>) -> ExecutionOutcome {
    match joined {
        Ok(Ok(())) => ExecutionOutcome::Completed,
        Ok(Err(JobError::Rejected(reason))) => ExecutionOutcome::Rejected(reason),
        Ok(Err(JobError::Failed(e))) => ExecutionOutcome::Failed(e),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            ExecutionOutcome::Failed(format!("job panicked: {}", panic_message(&*panic)))
        }
        Err(e) => ExecutionOutcome::Failed(e.to_string()),
    }
}
