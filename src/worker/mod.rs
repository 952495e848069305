//! Worker process main loop.
//!
//! A worker announces itself with `Ready`, then runs one assigned batch at a
//! time and answers each with `Done`. It never talks to a queue backend: the
//! master applies the reported dispositions.
//!
//! In a worker process stdout carries the framed channel, so logging must go
//! to stderr.

pub mod engine;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::pool::handle::WorkerId;
use crate::pool::ipc::{self, IpcError, MasterMessage, WorkerMessage};

pub use engine::{
    ExecutionEngine, ExecutionOutcome, ExecutionReport, FinishedEvent, FinishedListener,
    FinishedState, TracingListener,
};

/// Per-process worker settings.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Exit after any batch in which a job timed out.
    pub retire_after_timeout: bool,
}

/// Why the worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The master asked the worker to stop.
    Shutdown,
    /// The master closed the channel.
    ChannelClosed,
    /// A job timed out and the worker retired itself.
    Retired,
}

/// Serves assignments from `input` until shutdown, reporting on `output`.
pub async fn run_worker<R, W>(
    config: WorkerConfig,
    engine: &ExecutionEngine,
    input: R,
    mut output: W,
) -> Result<WorkerExit, IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let worker_id = config.worker_id;
    let mut frames = ipc::frame_reader(input);

    ipc::send(
        &mut output,
        &WorkerMessage::Ready {
            worker_id: worker_id.0,
            pid: std::process::id(),
        },
    )
    .await?;
    info!(worker_id = %worker_id, pid = std::process::id(), "Worker ready");

    loop {
        let Some(message) = ipc::recv::<_, MasterMessage>(&mut frames).await? else {
            info!(worker_id = %worker_id, "Master closed the channel");
            return Ok(WorkerExit::ChannelClosed);
        };

        match message {
            MasterMessage::Shutdown => {
                info!(worker_id = %worker_id, "Worker shutting down");
                return Ok(WorkerExit::Shutdown);
            }
            MasterMessage::Assign { batch_id, units } => {
                debug!(worker_id = %worker_id, batch_id, units = units.len(), "Running batch");
                let mut results = Vec::with_capacity(units.len());
                let mut timed_out = false;
                for unit in &units {
                    let report = engine.execute(unit).await;
                    timed_out |= report.outcome == ExecutionOutcome::TimedOut;
                    results.push(report.to_result());
                }

                let retiring = config.retire_after_timeout && timed_out;
                ipc::send(
                    &mut output,
                    &WorkerMessage::Done {
                        worker_id: worker_id.0,
                        batch_id,
                        results,
                        retiring,
                    },
                )
                .await?;

                if retiring {
                    info!(worker_id = %worker_id, "Retiring after a timed out job");
                    return Ok(WorkerExit::Retired);
                }
            }
        }
    }
}

/// Runs the worker loop over this process's stdin and stdout.
pub async fn run_worker_process(
    config: WorkerConfig,
    engine: &ExecutionEngine,
) -> Result<WorkerExit, IpcError> {
    run_worker(config, engine, tokio::io::stdin(), tokio::io::stdout()).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::duplex;

    use super::*;
    use crate::error::JobError;
    use crate::job::{Encoder, HookRegistry, JobDescriptor, JobOptions, JobRegistry, JsonEncoder};
    use crate::pool::ipc::{FrameReader, WireUnit};
    use crate::queue::{Disposition, MessageId};

    fn engine() -> ExecutionEngine {
        let mut registry = JobRegistry::new();
        registry
            .register("Ok", JobOptions::new("default"), |_args: &[Value]| -> Result<(), JobError> {
                Ok(())
            })
            .register(
                "Slow",
                JobOptions::new("default").with_timeout(Duration::from_millis(50)),
                |_args: &[Value]| -> Result<(), JobError> {
                    std::thread::sleep(Duration::from_millis(150));
                    Ok(())
                },
            );
        ExecutionEngine::new(Arc::new(registry), Arc::new(HookRegistry::new()))
    }

    fn wire(id: &str, class: &str) -> WireUnit {
        WireUnit {
            id: MessageId::new(id),
            queue_name: "default".to_string(),
            body: JsonEncoder.encode(&JobDescriptor::new(class, vec![])).unwrap(),
        }
    }

    async fn next(frames: &mut FrameReader<tokio::io::DuplexStream>) -> WorkerMessage {
        ipc::recv(frames).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_ready_then_batch_then_shutdown() {
        let (mut to_worker, worker_in) = duplex(64 * 1024);
        let (worker_out, from_worker) = duplex(64 * 1024);
        let mut frames = ipc::frame_reader(from_worker);
        let engine = engine();
        let config = WorkerConfig {
            worker_id: WorkerId(4),
            retire_after_timeout: false,
        };

        let worker = tokio::spawn(async move { run_worker(config, &engine, worker_in, worker_out).await });

        assert!(matches!(next(&mut frames).await, WorkerMessage::Ready { worker_id: 4, .. }));

        ipc::send(
            &mut to_worker,
            &MasterMessage::Assign {
                batch_id: 9,
                units: vec![wire("a", "Ok"), wire("b", "Missing")],
            },
        )
        .await
        .unwrap();

        match next(&mut frames).await {
            WorkerMessage::Done {
                worker_id,
                batch_id,
                results,
                retiring,
            } => {
                assert_eq!(worker_id, 4);
                assert_eq!(batch_id, 9);
                assert!(!retiring);
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].id, MessageId::new("a"));
                assert_eq!(results[0].disposition, Disposition::Ack);
                assert_eq!(results[1].state, FinishedState::Failed);
                assert_eq!(results[1].disposition, Disposition::NoAck);
            }
            other => panic!("unexpected message {:?}", other),
        }

        ipc::send(&mut to_worker, &MasterMessage::Shutdown).await.unwrap();
        assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Shutdown);
    }

    #[tokio::test]
    async fn test_retires_after_timeout_when_configured() {
        let (mut to_worker, worker_in) = duplex(64 * 1024);
        let (worker_out, from_worker) = duplex(64 * 1024);
        let mut frames = ipc::frame_reader(from_worker);
        let engine = engine();
        let config = WorkerConfig {
            worker_id: WorkerId(1),
            retire_after_timeout: true,
        };

        let worker = tokio::spawn(async move { run_worker(config, &engine, worker_in, worker_out).await });
        next(&mut frames).await;

        ipc::send(
            &mut to_worker,
            &MasterMessage::Assign {
                batch_id: 1,
                units: vec![wire("slow", "Slow")],
            },
        )
        .await
        .unwrap();

        match next(&mut frames).await {
            WorkerMessage::Done { results, retiring, .. } => {
                assert!(retiring);
                assert_eq!(results[0].state, FinishedState::TimedOut);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Retired);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_the_loop() {
        let (to_worker, worker_in) = duplex(1024);
        let (worker_out, _from_worker) = duplex(1024);
        let engine = engine();
        let config = WorkerConfig {
            worker_id: WorkerId(0),
            retire_after_timeout: false,
        };

        drop(to_worker);
        let exit = run_worker(config, &engine, worker_in, worker_out).await.unwrap();
        assert_eq!(exit, WorkerExit::ChannelClosed);
    }
}
