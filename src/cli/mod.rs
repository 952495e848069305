//! Command-line interface for jobforge.
//!
//! Provides the master (`run`), the hidden worker process entry point
//! (`worker`) and a producer helper (`publish`).

mod builtin;
mod commands;

pub use builtin::{builtin_jobs, BUILTIN_QUEUE};
pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
