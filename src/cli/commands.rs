//! CLI command definitions for jobforge.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::job::{Encoder, HookRegistry, JobDescriptor, JsonEncoder};
use crate::manager::Manager;
use crate::metrics::{export_metrics, init_metrics};
use crate::pool::{ExecSpawner, WorkerId, WORKER_ID_ENV};
use crate::queue::{ConsumerFactory, MemoryBroker, Publisher, RedisBroker};
use crate::worker::{run_worker_process, ExecutionEngine, WorkerConfig};

use super::builtin::{builtin_jobs, BUILTIN_QUEUE};

/// Background job processor with a pre-spawned worker process pool.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Consume queues and run jobs in a supervised pool of worker processes")]
#[command(version)]
#[command(
    long_about = "jobforge consumes one or more queues, batches the fetched messages and runs them in a fixed pool of worker processes.\n\nExample usage:\n  jobforge run --redis-url redis://127.0.0.1/ --queues default,mail --workers 4\n  jobforge publish --redis-url redis://127.0.0.1/ --class Echo --args '[\"hello\"]'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Whether this invocation is a worker process, whose stdout is reserved
    /// for the channel to the master.
    pub fn is_worker(&self) -> bool {
        matches!(self.command, Commands::Worker(_))
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the master: consumers, batcher and worker pool.
    Run(RunArgs),

    /// Worker process entry point, started by the master.
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Publish a job to a queue.
    #[command(alias = "pub")]
    Publish(PublishArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML configuration file. Without it, `JOBFORGE_*` variables are read.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Comma-separated queue names to consume.
    #[arg(short = 'q', long, value_delimiter = ',')]
    pub queues: Option<Vec<String>>,

    /// Number of worker processes.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Units per batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Seconds of inactivity before a partial batch is flushed.
    #[arg(long)]
    pub batch_timeout: Option<f64>,

    /// Redis URL. Without one, an empty in-memory queue is consumed.
    #[arg(long, env = "JOBFORGE_REDIS_URL")]
    pub redis_url: Option<String>,
}

/// Arguments for the hidden worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Exit after a batch in which a job timed out.
    #[arg(long)]
    pub retire_after_timeout: bool,
}

/// Arguments for the publish command.
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Redis URL of the target backend.
    #[arg(long, env = "JOBFORGE_REDIS_URL")]
    pub redis_url: String,

    /// Destination queue (before prefixing).
    #[arg(short = 'q', long, default_value = BUILTIN_QUEUE)]
    pub queue: String,

    /// Prefix applied to the queue name.
    #[arg(long, env = "JOBFORGE_QUEUE_PREFIX")]
    pub queue_prefix: Option<String>,

    /// Job class name.
    #[arg(long)]
    pub class: String,

    /// Job arguments as a JSON array.
    #[arg(long, default_value = "[]")]
    pub args: String,

    /// Per-message timeout in seconds.
    #[arg(long)]
    pub timeout: Option<f64>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_master_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Publish(args) => run_publish_command(args),
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

fn load_config(args: &RunArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::from_env().context("Failed to read configuration from environment")?,
    };

    if let Some(queues) = &args.queues {
        config = config.with_queues(queues.iter().map(|q| q.trim()).filter(|q| !q.is_empty()));
    }
    if let Some(workers) = args.workers {
        config = config.with_num_workers(workers);
    }
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(secs) = args.batch_timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("Invalid batch timeout: {}", secs))?;
        config = config.with_batch_timeout(timeout);
    }
    if let Some(url) = &args.redis_url {
        config = config.with_redis_url(url.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn run_master_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    init_metrics().context("Failed to initialize metrics")?;

    let factory: Arc<dyn ConsumerFactory> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisBroker::connect(url)?.with_visibility_timeout(config.visibility_timeout),
        ),
        None => {
            warn!("No Redis URL configured; consuming an empty in-memory queue");
            Arc::new(MemoryBroker::new())
        }
    };

    let mut spawner = ExecSpawner::current_exe().context("Failed to locate current executable")?;
    if config.retire_after_timeout {
        spawner = spawner.with_arg("--retire-after-timeout");
    }

    let handle = Manager::new(config, factory, Arc::new(spawner)).start().await?;
    let reason = handle.wait().await?;

    info!(reason = %reason, "Master stopped");
    debug!(metrics = %export_metrics(), "Final metrics");
    Ok(())
}

// ============================================================================
// Worker Command Implementation
// ============================================================================

fn worker_id_from_env() -> anyhow::Result<WorkerId> {
    let raw = std::env::var(WORKER_ID_ENV)
        .with_context(|| format!("{} is not set; workers are started by `jobforge run`", WORKER_ID_ENV))?;
    let id = raw
        .parse::<u32>()
        .with_context(|| format!("Invalid {}: {}", WORKER_ID_ENV, raw))?;
    Ok(WorkerId(id))
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let config = WorkerConfig {
        worker_id: worker_id_from_env()?,
        retire_after_timeout: args.retire_after_timeout,
    };
    let engine = ExecutionEngine::new(Arc::new(builtin_jobs()), Arc::new(HookRegistry::new()));

    let exit = run_worker_process(config, &engine).await?;
    info!(worker_id = %config.worker_id, exit = ?exit, "Worker exiting");

    // Timed out jobs keep running on blocking threads that the runtime would
    // otherwise wait for on drop.
    if engine.lingering() > 0 {
        std::process::exit(0);
    }
    Ok(())
}

// ============================================================================
// Publish Command Implementation
// ============================================================================

fn build_descriptor(args: &PublishArgs) -> anyhow::Result<JobDescriptor> {
    let parsed: Value = serde_json::from_str(&args.args)
        .with_context(|| format!("Job args are not valid JSON: {}", args.args))?;
    let job_args = match parsed {
        Value::Array(values) => values,
        other => vec![other],
    };

    let mut descriptor = JobDescriptor::new(&args.class, job_args);
    if let Some(secs) = args.timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("Invalid timeout: {}", secs))?;
        descriptor = descriptor.with_timeout(timeout);
    }
    Ok(descriptor)
}

fn run_publish_command(args: PublishArgs) -> anyhow::Result<()> {
    let descriptor = build_descriptor(&args)?;
    let queue = match &args.queue_prefix {
        Some(prefix) => Config::default().with_queue_prefix(prefix.clone()).prefixed(&args.queue),
        None => args.queue.clone(),
    };

    let body = JsonEncoder.encode(&descriptor)?;
    let broker = RedisBroker::connect(&args.redis_url)?;
    let id = broker.publish(&queue, &body)?;

    info!(queue = %queue, class = %descriptor.class_name, message_id = %id, "Published job");
    println!("{}", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_run_args_override_config() {
        let cli = parse(&[
            "jobforge",
            "run",
            "--queues",
            "mail, reports",
            "--workers",
            "2",
            "--batch-size",
            "5",
            "--batch-timeout",
            "0.5",
        ]);
        let Commands::Run(mut args) = cli.command else {
            panic!("expected run command");
        };
        args.redis_url = None;

        let config = load_config(&args).unwrap();
        assert_eq!(config.queues, vec!["mail", "reports"]);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_run_args_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobforge.yaml");
        std::fs::write(&path, "queues: [billing]\nnum_workers: 3\n").unwrap();

        let cli = parse(&["jobforge", "run", "--config", path.to_str().unwrap(), "--workers", "6"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };

        let config = load_config(&args).unwrap();
        assert_eq!(config.queues, vec!["billing"]);
        assert_eq!(config.num_workers, 6);
    }

    #[test]
    fn test_run_rejects_zero_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobforge.yaml");
        std::fs::write(&path, "queues: [billing]\n").unwrap();

        let cli = parse(&["jobforge", "run", "--config", path.to_str().unwrap(), "--workers", "0"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_worker_command_is_hidden_worker_mode() {
        let cli = parse(&["jobforge", "worker", "--retire-after-timeout"]);
        assert!(cli.is_worker());
        match cli.command {
            Commands::Worker(args) => assert!(args.retire_after_timeout),
            _ => panic!("expected worker command"),
        }

        let cli = parse(&["jobforge", "--log-level", "debug", "run"]);
        assert!(!cli.is_worker());
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_publish_descriptor() {
        let cli = parse(&[
            "jobforge",
            "publish",
            "--redis-url",
            "redis://127.0.0.1/",
            "--class",
            "Sleep",
            "--args",
            "[0.5]",
            "--timeout",
            "2",
        ]);
        let Commands::Publish(args) = cli.command else {
            panic!("expected publish command");
        };
        assert_eq!(args.queue, BUILTIN_QUEUE);

        let descriptor = build_descriptor(&args).unwrap();
        assert_eq!(descriptor.class_name, "Sleep");
        assert_eq!(descriptor.args, vec![serde_json::json!(0.5)]);
        assert_eq!(descriptor.timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_publish_scalar_args_are_wrapped() {
        let cli = parse(&[
            "jobforge",
            "publish",
            "--redis-url",
            "redis://127.0.0.1/",
            "--class",
            "Echo",
            "--args",
            "\"hello\"",
        ]);
        let Commands::Publish(args) = cli.command else {
            panic!("expected publish command");
        };
        let descriptor = build_descriptor(&args).unwrap();
        assert_eq!(descriptor.args, vec![serde_json::json!("hello")]);
    }
}
