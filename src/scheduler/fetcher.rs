//! Thread-per-queue consumer strategy.
//!
//! Each configured queue gets a dedicated OS thread that fetches messages,
//! drops duplicates and feeds the shared [`Batcher`]. A failure or panic in
//! one queue's loop is logged and the loop keeps running; sibling queues are
//! unaffected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::batcher::Batcher;
use crate::error::QueueError;
use crate::job::hooks::panic_message;
use crate::metrics::MetricsCollector;
use crate::queue::{Consumer, ConsumerFactory, Deduplicated, DuplicateDetector, UnitOfWork};

/// Wait after a failed fetch before trying again.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Starts one fetch loop per queue.
pub struct ConsumerStrategy {
    factory: Arc<dyn ConsumerFactory>,
    detector: Arc<dyn DuplicateDetector>,
    batcher: Arc<Batcher>,
    fetch_timeout: Duration,
    metrics: MetricsCollector,
}

impl ConsumerStrategy {
    pub fn new(
        factory: Arc<dyn ConsumerFactory>,
        detector: Arc<dyn DuplicateDetector>,
        batcher: Arc<Batcher>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            detector,
            batcher,
            fetch_timeout,
            metrics: MetricsCollector::new(),
        }
    }

    /// Creates a consumer per queue and starts the fetch threads plus the
    /// batcher's idle timer.
    ///
    /// # Errors
    ///
    /// Fails if any consumer cannot be created or a thread cannot be
    /// spawned. Threads already started are stopped and joined first.
    pub fn start(&self, queues: &[String]) -> Result<FetcherHandle, QueueError> {
        let running = Arc::new(AtomicBool::new(true));
        let mut handle = FetcherHandle {
            running: running.clone(),
            consumers: Vec::with_capacity(queues.len()),
            threads: Vec::with_capacity(queues.len() + 1),
        };

        match self.spawn_all(queues, &running, &mut handle) {
            Ok(()) => {
                info!(queues = ?queues, "Consumer threads started");
                Ok(handle)
            }
            Err(e) => {
                handle.stop();
                handle.join();
                Err(e)
            }
        }
    }

    fn spawn_all(
        &self,
        queues: &[String],
        running: &Arc<AtomicBool>,
        handle: &mut FetcherHandle,
    ) -> Result<(), QueueError> {
        for queue in queues {
            let consumer: Arc<dyn Consumer> = Arc::new(Deduplicated::new(
                self.factory.create(queue)?,
                self.detector.clone(),
            ));
            handle.consumers.push(consumer.clone());

            let fetch_loop = FetchLoop {
                consumer,
                detector: self.detector.clone(),
                batcher: self.batcher.clone(),
                running: running.clone(),
                fetch_timeout: self.fetch_timeout,
                metrics: self.metrics.clone(),
            };
            let thread = thread::Builder::new()
                .name(format!("fetch-{}", queue))
                .spawn(move || fetch_loop.run())?;
            handle.threads.push(thread);
        }

        let timer = self.batcher.schedule(running.clone())?;
        handle.threads.push(timer);
        Ok(())
    }
}

struct FetchLoop {
    consumer: Arc<dyn Consumer>,
    detector: Arc<dyn DuplicateDetector>,
    batcher: Arc<Batcher>,
    running: Arc<AtomicBool>,
    fetch_timeout: Duration,
    metrics: MetricsCollector,
}

impl FetchLoop {
    fn run(self) {
        let queue = self.consumer.queue_name().to_string();
        debug!(queue = %queue, "Fetch loop started");

        while self.running.load(Ordering::SeqCst) {
            let outcome = catch_unwind(AssertUnwindSafe(|| self.fetch_once(&queue)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(queue = %queue, error = %e, "Fetch failed");
                    self.backoff();
                }
                Err(panic) => {
                    error!(
                        queue = %queue,
                        error = %panic_message(&*panic),
                        "Fetch loop panicked; continuing"
                    );
                    self.backoff();
                }
            }
        }

        debug!(queue = %queue, "Fetch loop stopped");
    }

    fn fetch_once(&self, queue: &str) -> Result<(), QueueError> {
        let Some(message) = self.consumer.fetch(self.fetch_timeout)? else {
            return Ok(());
        };

        if !self.running.load(Ordering::SeqCst) {
            debug!(queue = %queue, message_id = %message.id, "Stopped mid-fetch; leaving message for redelivery");
            return Ok(());
        }

        if self.detector.found_duplicate(queue, &message.id) {
            warn!(queue = %queue, message_id = %message.id, "Skipping duplicate message");
            self.metrics.record_duplicate(queue);
            return Ok(());
        }

        self.batcher
            .add(UnitOfWork::new(message.id, message.body, self.consumer.clone()));
        Ok(())
    }

    /// Sleeps for the backoff period, waking early on stop.
    fn backoff(&self) {
        let deadline = Instant::now() + FETCH_ERROR_BACKOFF;
        while self.running.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
    }
}

/// Running fetch threads.
pub struct FetcherHandle {
    running: Arc<AtomicBool>,
    consumers: Vec<Arc<dyn Consumer>>,
    threads: Vec<JoinHandle<()>>,
}

impl FetcherHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clears the running flag and interrupts blocked fetches.
    pub fn stop(&self) {
        self.stopper().stop();
    }

    /// A detached handle that can stop the fetch threads from another task.
    pub fn stopper(&self) -> FetchStopper {
        FetchStopper {
            running: self.running.clone(),
            consumers: self.consumers.clone(),
        }
    }

    /// Waits for every fetch thread and the batch timer to exit.
    pub fn join(&mut self) {
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("fetch").to_string();
            if let Err(panic) = thread.join() {
                error!(
                    thread = %name,
                    error = %panic_message(&*panic),
                    "Consumer thread panicked"
                );
            }
        }
    }
}

/// Stops the fetch threads without owning them.
#[derive(Clone)]
pub struct FetchStopper {
    running: Arc<AtomicBool>,
    consumers: Vec<Arc<dyn Consumer>>,
}

impl FetchStopper {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for consumer in &self.consumers {
            consumer.stop();
        }
    }
}

impl Drop for FetcherHandle {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
            self.join();
        }
    }
}
