//! Top-level wiring of the consumer pipeline and the worker pool.
//!
//! ```text
//! ConsumerStrategy ──► Batcher ──flush──► mpsc ──► WorkerPool ──► workers
//!                                                     ▲
//!                                   SignalChannel ────┘
//! ```
//!
//! The manager owns shutdown ordering: the pool is told to stop (by a signal
//! or [`ManagerHandle::shutdown`]). The fetch threads stop as soon as the
//! pool starts draining, so nothing new is leased during the grace period.
//! Once the pool reports, the fetch threads are joined.

use std::io;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::job::HookRegistry;
use crate::metrics::MetricsCollector;
use crate::pool::{
    PoolConfig, PoolError, PoolStats, ShutdownReason, Signal, SignalChannel, SignalNotifier,
    WorkerPool, WorkerSpawner,
};
use crate::queue::{ConsumerFactory, DuplicateDetector, MemoryDuplicateDetector, NoDuplicateDetection};
use crate::scheduler::{Batch, Batcher, ConsumerStrategy, FetcherHandle};

/// Builder for a running job-processing system.
pub struct Manager {
    config: Config,
    factory: Arc<dyn ConsumerFactory>,
    spawner: Arc<dyn WorkerSpawner>,
    detector: Option<Arc<dyn DuplicateDetector>>,
    hooks: Arc<HookRegistry>,
    install_signal_handlers: bool,
}

impl Manager {
    pub fn new(
        config: Config,
        factory: Arc<dyn ConsumerFactory>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            config,
            factory,
            spawner,
            detector: None,
            hooks: Arc::new(HookRegistry::new()),
            install_signal_handlers: true,
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Replaces the duplicate detector derived from `dedupe_ttl`.
    pub fn with_detector(mut self, detector: Arc<dyn DuplicateDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Whether to install process signal handlers. Embedders and tests that
    /// drive shutdown through [`ManagerHandle::shutdown`] can turn this off.
    pub fn with_signal_handlers(mut self, install: bool) -> Self {
        self.install_signal_handlers = install;
        self
    }

    fn detector(&self) -> Arc<dyn DuplicateDetector> {
        if let Some(detector) = &self.detector {
            return detector.clone();
        }
        match self.config.dedupe_ttl {
            Some(ttl) => Arc::new(MemoryDuplicateDetector::new(ttl, self.config.dedupe_capacity)),
            None => Arc::new(NoDuplicateDetection),
        }
    }

    /// Starts the worker pool, then the fetch threads.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, signal setup failure, or when a queue
    /// consumer cannot be created. On a consumer failure the already running
    /// pool is shut down before returning.
    pub async fn start(self) -> Result<ManagerHandle, PoolError> {
        self.config.validate()?;

        let mut signals = SignalChannel::new()?;
        if self.install_signal_handlers {
            signals.install()?;
        }

        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<Batch>();
        let metrics = MetricsCollector::new();
        let batcher = Arc::new(Batcher::new(
            self.config.batch_size,
            self.config.batch_timeout,
            move |batch: Batch| {
                metrics.record_batch_flushed(batch.trigger);
                if let Err(mpsc::error::SendError(batch)) = batch_tx.send(batch) {
                    warn!(units = batch.len(), "Worker pool is gone; leaving batch for redelivery");
                    batch.abandon();
                }
            },
        ));

        let pool = WorkerPool::new(
            PoolConfig::from(&self.config),
            self.spawner.clone(),
            self.hooks.clone(),
            signals,
            batch_rx,
        );
        let notifier = pool.notifier();
        let monitor = pool.monitor();
        let mut draining = pool.draining();
        let (done_tx, done_rx) = oneshot::channel();
        let pool_task = tokio::spawn(pool.run(done_tx));

        let strategy = ConsumerStrategy::new(
            self.factory.clone(),
            self.detector(),
            batcher.clone(),
            self.config.fetch_timeout,
        );
        let queues = self.config.prefixed_queue_names();
        let fetcher = match strategy.start(&queues) {
            Ok(fetcher) => fetcher,
            Err(e) => {
                warn!(error = %e, "Failed to start consumers; stopping worker pool");
                if let Err(notify_err) = notifier.notify(Signal::Terminate) {
                    warn!(error = %notify_err, "Failed to signal worker pool");
                }
                let _ = pool_task.await;
                return Err(e.into());
            }
        };

        let stopper = fetcher.stopper();
        tokio::spawn(async move {
            if draining.wait_for(|draining| *draining).await.is_ok() {
                debug!("Worker pool draining; stopping consumers");
            }
            stopper.stop();
        });

        info!(
            queues = ?queues,
            workers = self.config.num_workers,
            batch_size = self.config.batch_size,
            "Manager started"
        );

        Ok(ManagerHandle {
            fetcher: Some(fetcher),
            batcher,
            notifier,
            monitor,
            done: done_rx,
            pool_task,
        })
    }
}

/// A running manager.
pub struct ManagerHandle {
    fetcher: Option<FetcherHandle>,
    batcher: Arc<Batcher>,
    notifier: SignalNotifier,
    monitor: watch::Receiver<PoolStats>,
    done: oneshot::Receiver<ShutdownReason>,
    pool_task: JoinHandle<Result<ShutdownReason, PoolError>>,
}

impl ManagerHandle {
    /// Requests a graceful shutdown, as if the process got SIGTERM.
    pub fn shutdown(&self) -> io::Result<()> {
        self.notifier.notify(Signal::Terminate)
    }

    pub fn notifier(&self) -> SignalNotifier {
        self.notifier.clone()
    }

    pub fn monitor(&self) -> watch::Receiver<PoolStats> {
        self.monitor.clone()
    }

    /// Waits for the pool to shut down, then joins the fetch threads. Units
    /// still buffered in the batcher are left for redelivery.
    pub async fn wait(mut self) -> Result<ShutdownReason, PoolError> {
        if (&mut self.done).await.is_err() {
            warn!("Worker pool exited without a shutdown notification");
        }

        if let Some(mut fetcher) = self.fetcher.take() {
            fetcher.stop();
            let joined = tokio::task::spawn_blocking(move || fetcher.join()).await;
            if let Err(e) = joined {
                warn!(error = %e, "Failed to join consumer threads");
            }
        }
        self.batcher.flush();

        match (&mut self.pool_task).await {
            Ok(result) => result,
            Err(e) => Err(PoolError::TaskFailed(e.to_string())),
        }
    }
}
