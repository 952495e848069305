//! Worker process creation.
//!
//! Workers are separate processes started through a [`WorkerSpawner`]. The
//! master keeps one stdin/stdout pair per child as its private channel; the
//! child's stderr is inherited so worker logs land next to the master's.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::handle::WorkerId;

/// Environment variable carrying the worker id into the child.
pub const WORKER_ID_ENV: &str = "JOBFORGE_WORKER_ID";

/// Builds the command that starts one worker process.
///
/// Stdio and process-group settings are applied by the pool; implementations
/// only choose the program, arguments and environment.
pub trait WorkerSpawner: Send + Sync {
    fn command(&self, id: WorkerId) -> Command;
}

/// Spawns workers by executing a program, by default the current binary
/// with the hidden `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ExecSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// `<current executable> worker`
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).with_arg("worker"))
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl WorkerSpawner for ExecSpawner {
    fn command(&self, id: WorkerId) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command.env(WORKER_ID_ENV, id.0.to_string());
        command
    }
}

/// A started worker process with its channel halves.
pub(crate) struct SpawnedWorker {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub pid: Option<u32>,
}

/// Starts a worker in its own process group so terminal interrupts reach
/// only the master.
pub(crate) fn spawn_worker(spawner: &dyn WorkerSpawner, id: WorkerId) -> io::Result<SpawnedWorker> {
    let mut command = spawner.command(id);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .process_group(0);

    let mut child = command.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Failed to capture worker stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Failed to capture worker stdout"))?;
    let pid = child.id();

    Ok(SpawnedWorker {
        child,
        stdin,
        stdout,
        pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_spawner_sets_worker_id() {
        let spawner = ExecSpawner::new("/bin/true")
            .with_arg("worker")
            .with_env("RUST_LOG", "debug");
        let command = spawner.command(WorkerId(5));
        let std = command.as_std();

        assert_eq!(std.get_program(), "/bin/true");
        let args: Vec<_> = std.get_args().collect();
        assert_eq!(args, vec!["worker"]);
        let envs: Vec<_> = std
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert!(envs.contains(&(WORKER_ID_ENV.to_string(), "5".to_string())));
        assert!(envs.contains(&("RUST_LOG".to_string(), "debug".to_string())));
    }

    #[test]
    fn test_current_exe_runs_worker_subcommand() {
        let spawner = ExecSpawner::current_exe().unwrap();
        let command = spawner.command(WorkerId(0));
        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args, vec!["worker"]);
    }

    #[tokio::test]
    async fn test_spawn_worker_captures_channel() {
        let spawner = ExecSpawner::new("/bin/cat");
        let mut worker = spawn_worker(&spawner, WorkerId(1)).unwrap();
        assert!(worker.pid.is_some());
        worker.child.start_kill().unwrap();
    }
}
