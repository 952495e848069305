//! Job classes shipped with the binary.
//!
//! These exist so a pool can be driven end to end without user code:
//!
//! | Class    | Args                  | Result                      |
//! |----------|-----------------------|-----------------------------|
//! | `Echo`   | anything              | logs the args, completes    |
//! | `Sleep`  | `[seconds]`           | sleeps, completes           |
//! | `Fail`   | `[message]` optional  | fails                       |
//! | `Reject` | `[reason]` optional   | rejects (redelivered)       |

use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::error::JobError;
use crate::job::{JobOptions, JobRegistry};

/// Queue the built-in jobs publish to by default.
pub const BUILTIN_QUEUE: &str = "default";

/// Registry with every built-in job class.
pub fn builtin_jobs() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry
        .register("Echo", JobOptions::new(BUILTIN_QUEUE), echo)
        .register("Sleep", JobOptions::new(BUILTIN_QUEUE), sleep)
        .register("Fail", JobOptions::new(BUILTIN_QUEUE), fail)
        .register("Reject", JobOptions::new(BUILTIN_QUEUE), reject);
    registry
}

fn echo(args: &[Value]) -> Result<(), JobError> {
    let args = Value::Array(args.to_vec());
    info!(args = %args, "Echo");
    Ok(())
}

fn sleep(args: &[Value]) -> Result<(), JobError> {
    let secs = args.first().and_then(Value::as_f64).unwrap_or(1.0);
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|_| JobError::failed(format!("Invalid sleep duration: {}", secs)))?;
    std::thread::sleep(duration);
    Ok(())
}

fn first_str(args: &[Value]) -> Option<&str> {
    args.first().and_then(Value::as_str)
}

fn fail(args: &[Value]) -> Result<(), JobError> {
    Err(JobError::failed(first_str(args).unwrap_or("Fail job")))
}

fn reject(args: &[Value]) -> Result<(), JobError> {
    Err(JobError::rejected(first_str(args).unwrap_or("Reject job")))
}
