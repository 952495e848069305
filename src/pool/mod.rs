//! Worker process pool.
//!
//! The master spawns a fixed number of worker processes, each with a private
//! framed channel over its stdin/stdout, and supervises them from a single
//! event loop:
//!
//! - **signal**: self-pipe relay for SIGCHLD, SIGINT, SIGQUIT and SIGTERM
//! - **ipc**: length-delimited JSON messages between master and worker
//! - **handle**: per-worker state machine (`Spawning → Ready → Busy → Dead`)
//! - **spawner**: how a worker process is started
//! - **supervisor**: the event loop, respawn and shutdown cascade

pub mod handle;
pub mod ipc;
pub mod signal;
pub mod spawner;
pub mod supervisor;

pub use handle::{InFlight, TransitionError, WorkerHandle, WorkerId, WorkerState};
pub use ipc::{IpcError, MasterMessage, UnitResult, WireUnit, WorkerMessage};
pub use signal::{Signal, SignalChannel, SignalError, SignalNotifier};
pub use spawner::{ExecSpawner, WorkerSpawner, WORKER_ID_ENV};
pub use supervisor::{PoolConfig, PoolError, PoolStats, ShutdownReason, WorkerPool, WorkerSnapshot};
