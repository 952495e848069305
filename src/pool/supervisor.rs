//! The master event loop.
//!
//! One task owns every [`WorkerHandle`], the [`WorkDistributor`] and the
//! [`SignalChannel`]. Each iteration waits, with a bounded timeout, on
//! signals, worker messages and newly flushed batches, reacts on this task
//! only, then hands pending batches to ready workers.
//!
//! Failure classes:
//!
//! - a worker process that exits or closes its channel is replaced by exactly
//!   one new worker; its in-flight units are left unacknowledged
//! - a write to a worker that has already exited returns the batch to the
//!   head of the pending queue
//! - a batch too large for one frame is split in halves; a single unit too
//!   large to send is left unacknowledged and logged
//! - a write to a live worker that fails, a failed spawn or a broken signal
//!   pipe is a terrible failure: every worker is killed and the pool stops

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::handle::{InFlight, TransitionError, WorkerHandle, WorkerId, WorkerState};
use super::ipc::{self, IpcError, MasterMessage, UnitResult, WorkerMessage};
use super::signal::{Signal, SignalChannel, SignalError, SignalNotifier};
use super::spawner::{spawn_worker, WorkerSpawner};
use crate::config::{Config, ConfigError};
use crate::error::QueueError;
use crate::job::hooks::{HookContext, HookKind, HookRegistry};
use crate::metrics::MetricsCollector;
use crate::queue::UnitOfWork;
use crate::scheduler::{Assignment, Batch, WorkDistributor};

/// Upper bound on a single write to a worker's channel.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling interval while waiting for workers to exit.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// How long a killed worker is given to be reaped.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Errors that stop the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker channel or the signal pipe is unusable.
    #[error("Channel failure: {0}")]
    ChannelFailure(String),

    /// A worker process could not be started.
    #[error("Failed to spawn {worker}: {source}")]
    SpawnFailed {
        worker: WorkerId,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("Invalid worker state change: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The task running the pool panicked or was cancelled.
    #[error("Pool task failed: {0}")]
    TaskFailed(String),
}

/// Why the pool stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An interrupt, quit or terminate signal.
    Signal(Signal),
    /// The batch source went away.
    Requested,
    /// A terrible failure aborted the pool.
    Fatal(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal(signal) => write!(f, "signal {}", signal),
            ShutdownReason::Requested => f.write_str("requested"),
            ShutdownReason::Fatal(e) => write!(f, "fatal: {}", e),
        }
    }
}

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_workers: usize,
    /// Longest the event loop blocks before running housekeeping.
    pub select_timeout: Duration,
    /// Grace period for workers to exit before they are killed.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            num_workers: config.num_workers,
            select_timeout: config.select_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// One worker as seen in [`PoolStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
    /// Batch the worker is running, if busy.
    pub batch_id: Option<u64>,
}

/// Point-in-time view of the pool, published after every loop iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: Vec<WorkerSnapshot>,
    pub spawned_total: u64,
    pub respawned_total: u64,
    pub batches_assigned: u64,
    pub units_settled: u64,
    pub pending_batches: usize,
    pub pending_units: usize,
    pub accepting: bool,
}

impl PoolStats {
    /// Number of workers in `state`.
    pub fn count(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }
}

enum WorkerEvent {
    Message(WorkerId, WorkerMessage),
    Closed(WorkerId),
    Corrupt(WorkerId, IpcError),
}

enum Step {
    Signal(io::Result<Signal>),
    Worker(WorkerEvent),
    Batch(Option<Batch>),
    Tick,
}

struct WorkerSlot {
    handle: WorkerHandle,
    child: Child,
    channel: ChildStdin,
    reader: JoinHandle<()>,
}

impl WorkerSlot {
    fn kill(&mut self) {
        let _ = self.child.start_kill();
        self.reader.abort();
    }
}

/// Forwards every frame a worker writes to the event loop.
fn spawn_reader(
    id: WorkerId,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut frames = ipc::frame_reader(stdout);
        loop {
            let event = match ipc::recv::<_, WorkerMessage>(&mut frames).await {
                Ok(Some(message)) => WorkerEvent::Message(id, message),
                Ok(None) => WorkerEvent::Closed(id),
                Err(e) => WorkerEvent::Corrupt(id, e),
            };
            let last = !matches!(event, WorkerEvent::Message(..));
            if events.send(event).is_err() || last {
                break;
            }
        }
    })
}

/// Supervises a fixed-size pool of worker processes.
pub struct WorkerPool {
    config: PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    hooks: Arc<HookRegistry>,
    signals: SignalChannel,
    batches: mpsc::UnboundedReceiver<Batch>,
    distributor: WorkDistributor,
    workers: BTreeMap<WorkerId, WorkerSlot>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    stats: watch::Sender<PoolStats>,
    draining: watch::Sender<bool>,
    spawned_total: u64,
    respawned_total: u64,
    batches_assigned: u64,
    units_settled: u64,
    next_worker: u32,
    next_batch: u64,
    accepting: bool,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a pool fed by `batches`. Nothing is spawned until [`run`](Self::run).
    pub fn new(
        config: PoolConfig,
        spawner: Arc<dyn WorkerSpawner>,
        hooks: Arc<HookRegistry>,
        signals: SignalChannel,
        batches: mpsc::UnboundedReceiver<Batch>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stats, _) = watch::channel(PoolStats::default());
        let (draining, _) = watch::channel(false);
        Self {
            config,
            spawner,
            hooks,
            signals,
            batches,
            distributor: WorkDistributor::new(),
            workers: BTreeMap::new(),
            events_tx,
            events_rx,
            stats,
            draining,
            spawned_total: 0,
            respawned_total: 0,
            batches_assigned: 0,
            units_settled: 0,
            next_worker: 0,
            next_batch: 0,
            accepting: true,
            metrics: MetricsCollector::new(),
        }
    }

    /// Handle for injecting signals, e.g. to request shutdown.
    pub fn notifier(&self) -> SignalNotifier {
        self.signals.notifier()
    }

    pub fn monitor(&self) -> watch::Receiver<PoolStats> {
        self.stats.subscribe()
    }

    /// Flips to `true` the moment the pool stops accepting work, before
    /// workers are drained.
    pub fn draining(&self) -> watch::Receiver<bool> {
        self.draining.subscribe()
    }

    /// Runs the pool until shutdown and reports the reason on `done`
    /// exactly once, after every worker has exited or been killed.
    pub async fn run(
        mut self,
        done: oneshot::Sender<ShutdownReason>,
    ) -> Result<ShutdownReason, PoolError> {
        let result = match self.supervise().await {
            Ok(reason) => {
                info!(reason = %reason, "Shutting down worker pool");
                self.shutdown().await;
                Ok(reason)
            }
            Err(e) => {
                error!(error = %e, "Terrible failure in worker pool; aborting");
                self.abort().await;
                Err(e)
            }
        };

        let reason = match &result {
            Ok(reason) => reason.clone(),
            Err(e) => ShutdownReason::Fatal(e.to_string()),
        };
        info!(reason = %reason, "Worker pool stopped");
        if done.send(reason).is_err() {
            debug!("Nobody is waiting for the pool shutdown notification");
        }
        result
    }

    async fn supervise(&mut self) -> Result<ShutdownReason, PoolError> {
        self.hooks
            .run(HookKind::BeforeFirstFork, &HookContext::global());
        for _ in 0..self.config.num_workers {
            self.spawn()?;
        }
        info!(workers = self.config.num_workers, "Worker pool started");
        self.publish_stats();

        loop {
            let step = tokio::select! {
                biased;
                signal = self.signals.recv() => Step::Signal(signal),
                Some(event) = self.events_rx.recv() => Step::Worker(event),
                batch = self.batches.recv() => Step::Batch(batch),
                _ = tokio::time::sleep(self.config.select_timeout) => Step::Tick,
            };

            match step {
                Step::Signal(Ok(Signal::Child)) | Step::Tick => self.sweep()?,
                Step::Signal(Ok(signal)) => {
                    info!(signal = %signal, "Received shutdown signal");
                    return Ok(ShutdownReason::Signal(signal));
                }
                Step::Signal(Err(e)) => {
                    return Err(PoolError::ChannelFailure(format!(
                        "signal pipe read failed: {}",
                        e
                    )));
                }
                Step::Worker(event) => self.handle_event(event)?,
                Step::Batch(Some(batch)) => self.distributor.push(batch),
                Step::Batch(None) => {
                    info!("Batch source closed");
                    return Ok(ShutdownReason::Requested);
                }
            }

            self.dispatch().await?;
            self.publish_stats();
        }
    }

    fn spawn(&mut self) -> Result<WorkerId, PoolError> {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;

        let spawned = spawn_worker(self.spawner.as_ref(), id)
            .map_err(|source| PoolError::SpawnFailed { worker: id, source })?;
        let reader = spawn_reader(id, spawned.stdout, self.events_tx.clone());
        info!(worker_id = %id, pid = ?spawned.pid, "Spawned worker");

        self.workers.insert(
            id,
            WorkerSlot {
                handle: WorkerHandle::new(id, spawned.pid),
                child: spawned.child,
                channel: spawned.stdin,
                reader,
            },
        );
        self.spawned_total += 1;
        self.metrics.set_workers(self.workers.len());
        Ok(id)
    }

    /// Drops a dead worker and, while accepting work, spawns its replacement.
    fn replace(&mut self, id: WorkerId, reason: &str) -> Result<(), PoolError> {
        let Some(mut slot) = self.workers.remove(&id) else {
            return Ok(());
        };
        let pid = slot.handle.pid();
        let uptime = slot.handle.uptime();

        match slot.handle.mark_dead() {
            Some(in_flight) => {
                warn!(
                    worker_id = %id,
                    pid = ?pid,
                    uptime = ?uptime,
                    batch_id = in_flight.batch_id,
                    units = in_flight.units.len(),
                    reason,
                    "Worker died with work in flight; leaving messages for redelivery"
                );
                in_flight.abandon();
            }
            None if self.accepting => {
                warn!(worker_id = %id, pid = ?pid, uptime = ?uptime, reason, "Worker exited")
            }
            None => debug!(worker_id = %id, pid = ?pid, uptime = ?uptime, reason, "Worker exited"),
        }
        slot.kill();

        if self.accepting {
            self.spawn()?;
            self.respawned_total += 1;
            self.metrics.record_respawn();
        }
        self.metrics.set_workers(self.workers.len());
        Ok(())
    }

    /// Reaps exited workers.
    fn sweep(&mut self) -> Result<(), PoolError> {
        let exited: Vec<(WorkerId, String)> = self
            .workers
            .iter_mut()
            .filter_map(|(id, slot)| match slot.child.try_wait() {
                Ok(Some(status)) => Some((*id, status.to_string())),
                Ok(None) => None,
                Err(e) => Some((*id, format!("wait failed: {}", e))),
            })
            .collect();

        for (id, status) in exited {
            self.replace(id, &status)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: WorkerEvent) -> Result<(), PoolError> {
        match event {
            WorkerEvent::Message(id, message) => self.handle_message(id, message),
            WorkerEvent::Closed(id) => self.replace(id, "channel closed"),
            WorkerEvent::Corrupt(id, e) => {
                warn!(worker_id = %id, error = %e, "Unreadable frame from worker");
                self.replace(id, "protocol error")
            }
        }
    }

    fn handle_message(&mut self, id: WorkerId, message: WorkerMessage) -> Result<(), PoolError> {
        if !self.workers.contains_key(&id) {
            debug!(worker_id = %id, "Ignoring message from a replaced worker");
            return Ok(());
        }
        if message.worker_id() != id.0 {
            warn!(worker_id = %id, claimed = message.worker_id(), "Worker reported the wrong id");
            return self.replace(id, "protocol error");
        }

        match message {
            WorkerMessage::Ready { pid, .. } => {
                let ready = match self.workers.get_mut(&id) {
                    Some(slot) => slot.handle.mark_ready(),
                    None => return Ok(()),
                };
                if let Err(e) = ready {
                    warn!(error = %e, "Unexpected ready message");
                    return self.replace(id, "protocol error");
                }
                debug!(worker_id = %id, pid, "Worker ready");
                Ok(())
            }
            WorkerMessage::Done {
                batch_id,
                results,
                retiring,
                ..
            } => {
                let finished = match self.workers.get_mut(&id) {
                    Some(slot) => slot.handle.finish(batch_id),
                    None => return Ok(()),
                };
                let in_flight = match finished {
                    Ok(in_flight) => in_flight,
                    Err(e) => {
                        warn!(error = %e, batch_id, "Unexpected batch result");
                        return self.replace(id, "protocol error");
                    }
                };
                self.settle(id, in_flight, results);

                if retiring {
                    info!(worker_id = %id, "Worker retiring after a timed out job");
                    return self.replace(id, "retired after timeout");
                }
                Ok(())
            }
        }
    }

    /// Applies each reported disposition on the unit's originating consumer.
    fn settle(&mut self, id: WorkerId, mut in_flight: InFlight, results: Vec<UnitResult>) {
        for result in results {
            let Some(unit) = in_flight.take(&result.id) else {
                warn!(worker_id = %id, message_id = %result.id, "Result for a unit not in this batch");
                continue;
            };
            let queue = unit.queue_name().to_string();
            self.metrics.record_finished(
                result.state.as_str(),
                &queue,
                result.class_name.as_deref(),
                result.duration_ms as f64 / 1000.0,
            );
            debug!(
                worker_id = %id,
                queue = %queue,
                message_id = %result.id,
                state = result.state.as_str(),
                disposition = %result.disposition,
                "Settling unit"
            );
            unit.settle(result.disposition);
            self.units_settled += 1;
        }

        if !in_flight.units.is_empty() {
            warn!(
                worker_id = %id,
                batch_id = in_flight.batch_id,
                units = in_flight.units.len(),
                "No result reported for some units; leaving them for redelivery"
            );
        }
        in_flight.abandon();
    }

    /// Gives each ready worker at most one pending batch. Repeats while a
    /// worker is left ready, since an oversized batch is split back into
    /// the pending queue instead of being sent.
    async fn dispatch(&mut self) -> Result<(), PoolError> {
        while self.accepting && !self.distributor.is_empty() {
            let ready: Vec<WorkerId> = self
                .workers
                .values()
                .filter(|slot| slot.handle.is_ready())
                .map(|slot| slot.handle.id())
                .collect();

            let assignments = self.distributor.assign(ready);
            if assignments.is_empty() {
                break;
            }
            for Assignment { worker_id, batch } in assignments {
                self.send_assignment(worker_id, batch).await?;
            }
        }
        self.metrics.set_pending_batches(self.distributor.pending_len());
        Ok(())
    }

    async fn send_assignment(&mut self, id: WorkerId, batch: Batch) -> Result<(), PoolError> {
        if !self.workers.contains_key(&id) {
            self.distributor.requeue_front(batch);
            return Ok(());
        }

        let batch_id = self.next_batch;
        self.next_batch += 1;
        let message = MasterMessage::Assign {
            batch_id,
            units: batch.units.iter().map(UnitOfWork::to_wire).collect(),
        };
        let body = match ipc::encode(&message) {
            Ok(body) => body,
            Err(e) => {
                self.refuse_unsendable(id, batch, e);
                return Ok(());
            }
        };

        let Some(slot) = self.workers.get_mut(&id) else {
            self.distributor.requeue_front(batch);
            return Ok(());
        };
        let sent = match timeout(SEND_TIMEOUT, ipc::send_encoded(&mut slot.channel, &body)).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write to worker timed out",
            ))),
        };

        match sent {
            Ok(()) => {
                debug!(worker_id = %id, batch_id, units = batch.len(), "Assigned batch");
                slot.handle.assign(batch_id, batch.units)?;
                self.batches_assigned += 1;
                Ok(())
            }
            Err(e) if e.is_disconnect() || matches!(slot.child.try_wait(), Ok(Some(_))) => {
                warn!(worker_id = %id, batch_id, error = %e, "Worker died before taking its batch; requeueing");
                self.distributor.requeue_front(batch);
                self.replace(id, "channel closed")
            }
            Err(e) => {
                batch.abandon();
                Err(PoolError::ChannelFailure(format!(
                    "failed to send batch {} to {}: {}",
                    batch_id, id, e
                )))
            }
        }
    }

    /// Handles a batch whose assignment cannot be framed. A batch of several
    /// units goes back to the head of the queue in two halves; a single unit
    /// is left unacknowledged. The worker stays ready either way.
    fn refuse_unsendable(&mut self, id: WorkerId, batch: Batch, e: IpcError) {
        if matches!(e, IpcError::FrameTooLarge(_)) && batch.len() > 1 {
            warn!(worker_id = %id, units = batch.len(), error = %e, "Batch too large for one frame; splitting");
            let (head, tail) = batch.split();
            self.distributor.requeue_front(tail);
            self.distributor.requeue_front(head);
            return;
        }
        for unit in &batch.units {
            error!(
                worker_id = %id,
                queue = %unit.queue_name(),
                message_id = %unit.id(),
                error = %e,
                "Cannot send unit to a worker; leaving it unacknowledged"
            );
        }
        batch.abandon();
    }

    /// Stops accepting work, tells every worker to finish and exit, and
    /// kills whatever is left after the grace period.
    async fn shutdown(&mut self) {
        self.accepting = false;
        self.draining.send_replace(true);
        if let Err(e) = self.signals.reset() {
            warn!(error = %e, "Failed to restore default signal handlers");
        }
        self.abandon_pending();

        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            let Some(slot) = self.workers.get_mut(&id) else {
                continue;
            };
            match timeout(SEND_TIMEOUT, ipc::send(&mut slot.channel, &MasterMessage::Shutdown)).await {
                Ok(Ok(())) => debug!(worker_id = %id, "Sent shutdown"),
                Ok(Err(e)) => debug!(worker_id = %id, error = %e, "Worker did not take the shutdown message"),
                Err(_) => debug!(worker_id = %id, "Timed out sending shutdown"),
            }
        }
        self.publish_stats();

        let deadline = Instant::now().checked_add(self.config.shutdown_timeout);
        let poll = self.config.select_timeout.min(SHUTDOWN_POLL);
        while !self.workers.is_empty() {
            let remaining = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if remaining.is_zero() {
                break;
            }

            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.handle_event(event) {
                        warn!(error = %e, "Error while draining worker results");
                    }
                }
                _ = tokio::time::sleep(poll.min(remaining)) => {}
            }
            if let Err(e) = self.sweep() {
                warn!(error = %e, "Error while reaping workers");
            }
            self.publish_stats();
        }

        if !self.workers.is_empty() {
            warn!(
                workers = self.workers.len(),
                timeout = ?self.config.shutdown_timeout,
                "Workers did not exit in time; killing"
            );
            self.kill_all().await;
        }
        self.metrics.set_workers(0);
        self.publish_stats();
    }

    /// Kills everything without waiting for in-flight work.
    async fn abort(&mut self) {
        self.accepting = false;
        self.draining.send_replace(true);
        if let Err(e) = self.signals.reset() {
            warn!(error = %e, "Failed to restore default signal handlers");
        }
        self.abandon_pending();
        self.kill_all().await;
        self.metrics.set_workers(0);
        self.publish_stats();
    }

    fn abandon_pending(&mut self) {
        self.batches.close();
        let mut units = 0;
        while let Ok(batch) = self.batches.try_recv() {
            units += batch.len();
            batch.abandon();
        }
        for batch in self.distributor.drain() {
            units += batch.len();
            batch.abandon();
        }
        if units > 0 {
            info!(units, "Left pending units unacknowledged for redelivery");
        }
        self.metrics.set_pending_batches(0);
    }

    async fn kill_all(&mut self) {
        for (id, mut slot) in std::mem::take(&mut self.workers) {
            if let Some(in_flight) = slot.handle.mark_dead() {
                warn!(
                    worker_id = %id,
                    batch_id = in_flight.batch_id,
                    units = in_flight.units.len(),
                    "Killing worker with work in flight; leaving messages for redelivery"
                );
                in_flight.abandon();
            }
            slot.kill();

            let deadline = Instant::now() + KILL_GRACE;
            while Instant::now() < deadline {
                match slot.child.try_wait() {
                    Ok(None) => tokio::time::sleep(Duration::from_millis(10)).await,
                    _ => break,
                }
            }
            debug!(worker_id = %id, "Worker killed");
        }
    }

    fn publish_stats(&self) {
        let workers = self
            .workers
            .values()
            .map(|slot| WorkerSnapshot {
                id: slot.handle.id(),
                pid: slot.handle.pid(),
                state: slot.handle.state(),
                batch_id: slot.handle.in_flight().map(|in_flight| in_flight.batch_id),
            })
            .collect();

        self.stats.send_replace(PoolStats {
            workers,
            spawned_total: self.spawned_total,
            respawned_total: self.respawned_total,
            batches_assigned: self.batches_assigned,
            units_settled: self.units_settled,
            pending_batches: self.distributor.pending_len(),
            pending_units: self.distributor.pending_units(),
            accepting: self.accepting,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::pool::spawner::ExecSpawner;
    use crate::queue::{Consumer, MemoryQueue};

    fn config(num_workers: usize) -> PoolConfig {
        PoolConfig {
            num_workers,
            select_timeout: Duration::from_millis(50),
            shutdown_timeout: Duration::from_millis(300),
        }
    }

    fn shell(script: &str) -> Arc<dyn WorkerSpawner> {
        Arc::new(ExecSpawner::new("/bin/sh").with_arg("-c").with_arg(script))
    }

    fn pool(
        spawner: Arc<dyn WorkerSpawner>,
        config: PoolConfig,
        hooks: HookRegistry,
    ) -> (WorkerPool, mpsc::UnboundedSender<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            config,
            spawner,
            Arc::new(hooks),
            SignalChannel::new().unwrap(),
            rx,
        );
        (pool, tx)
    }

    async fn wait_for<F>(monitor: &mut watch::Receiver<PoolStats>, predicate: F)
    where
        F: Fn(&PoolStats) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if predicate(&*monitor.borrow()) {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(!remaining.is_zero(), "pool never reached the expected state");
            let _ = timeout(remaining, monitor.changed()).await;
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal_and_notified_once() {
        let spawner: Arc<dyn WorkerSpawner> = Arc::new(ExecSpawner::new("/nonexistent/jobforge"));
        let (pool, _batches) = pool(spawner, config(2), HookRegistry::new());
        let (done_tx, done_rx) = oneshot::channel();

        let result = pool.run(done_tx).await;

        assert!(matches!(result, Err(PoolError::SpawnFailed { .. })));
        assert!(matches!(done_rx.await.unwrap(), ShutdownReason::Fatal(_)));
    }

    #[tokio::test]
    async fn test_interrupt_kills_workers_that_ignore_shutdown() {
        let (pool, _batches) = pool(shell("exec sleep 30"), config(2), HookRegistry::new());
        let notifier = pool.notifier();
        let mut monitor = pool.monitor();
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(pool.run(done_tx));

        wait_for(&mut monitor, |s| s.workers.len() == 2).await;
        notifier.notify(Signal::Interrupt).unwrap();

        let reason = timeout(Duration::from_secs(10), done_rx).await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Signal(Signal::Interrupt));
        assert_eq!(
            task.await.unwrap().unwrap(),
            ShutdownReason::Signal(Signal::Interrupt)
        );

        let stats = monitor.borrow().clone();
        assert!(stats.workers.is_empty());
        assert!(!stats.accepting);
        assert_eq!(stats.respawned_total, 0);
    }

    #[tokio::test]
    async fn test_draining_flips_before_workers_exit() {
        let (pool, _batches) = pool(shell("exec sleep 30"), config(1), HookRegistry::new());
        let notifier = pool.notifier();
        let mut monitor = pool.monitor();
        let mut draining = pool.draining();
        let (done_tx, mut done_rx) = oneshot::channel();
        let task = tokio::spawn(pool.run(done_tx));

        wait_for(&mut monitor, |s| s.workers.len() == 1).await;
        assert!(!*draining.borrow());
        notifier.notify(Signal::Terminate).unwrap();

        timeout(Duration::from_secs(10), draining.wait_for(|d| *d))
            .await
            .unwrap()
            .unwrap();
        // The worker ignores shutdown, so the grace period is still running.
        assert!(done_rx.try_recv().is_err());

        timeout(Duration::from_secs(10), done_rx).await.unwrap().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dead_workers_are_replaced_one_for_one() {
        let forks = Arc::new(AtomicUsize::new(0));
        let counter = forks.clone();
        let mut hooks = HookRegistry::new();
        hooks.add(HookKind::BeforeFirstFork, move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (pool, _batches) = pool(shell("exec sleep 0.2"), config(2), hooks);
        let notifier = pool.notifier();
        let mut monitor = pool.monitor();
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(pool.run(done_tx));

        wait_for(&mut monitor, |s| s.respawned_total >= 2 && s.workers.len() == 2).await;
        notifier.notify(Signal::Terminate).unwrap();
        timeout(Duration::from_secs(10), done_rx).await.unwrap().unwrap();
        task.await.unwrap().unwrap();

        let stats = monitor.borrow().clone();
        assert_eq!(stats.spawned_total, 2 + stats.respawned_total);
        assert_eq!(forks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_batch_source_requests_shutdown() {
        let (pool, batches) = pool(shell("exec sleep 30"), config(1), HookRegistry::new());
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(pool.run(done_tx));

        drop(batches);

        let reason = timeout(Duration::from_secs(10), done_rx).await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_pending_batches_are_left_unacked_on_shutdown() {
        let queue = Arc::new(MemoryQueue::new("mail"));
        let units: Vec<UnitOfWork> = (0..3)
            .map(|i| {
                queue.push(format!("job-{}", i));
                let m = queue.fetch(Duration::from_millis(10)).unwrap().unwrap();
                UnitOfWork::new(m.id, m.body, queue.clone())
            })
            .collect();

        // Workers never report ready, so the batch stays pending.
        let (pool, batches) = pool(shell("exec sleep 30"), config(1), HookRegistry::new());
        let notifier = pool.notifier();
        let mut monitor = pool.monitor();
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(pool.run(done_tx));

        batches
            .send(Batch {
                units,
                created_at: std::time::Instant::now(),
                trigger: crate::scheduler::FlushTrigger::Manual,
            })
            .unwrap();
        wait_for(&mut monitor, |s| s.pending_batches == 1).await;
        assert_eq!(monitor.borrow().pending_units, 3);
        notifier.notify(Signal::Quit).unwrap();
        timeout(Duration::from_secs(10), done_rx).await.unwrap().unwrap();
        task.await.unwrap().unwrap();

        assert!(queue.completed().is_empty());
        assert!(queue.rejected().is_empty());
        assert_eq!(queue.in_flight_len(), 3);
    }

    #[test]
    fn test_pool_config_from_config() {
        let config = Config::default()
            .with_num_workers(7)
            .with_shutdown_timeout(Duration::from_secs(3));
        let pool_config = PoolConfig::from(&config);
        assert_eq!(pool_config.num_workers, 7);
        assert_eq!(pool_config.shutdown_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_stats_count_by_state() {
        let stats = PoolStats {
            workers: vec![
                WorkerSnapshot {
                    id: WorkerId(0),
                    pid: None,
                    state: WorkerState::Ready,
                    batch_id: None,
                },
                WorkerSnapshot {
                    id: WorkerId(1),
                    pid: None,
                    state: WorkerState::Busy,
                    batch_id: Some(0),
                },
            ],
            ..Default::default()
        };
        assert_eq!(stats.count(WorkerState::Ready), 1);
        assert_eq!(stats.count(WorkerState::Spawning), 0);
        assert_eq!(ShutdownReason::Signal(Signal::Interrupt).to_string(), "signal SIGINT");
    }
}
