//! Runtime configuration.
//!
//! Configuration can be built in code, loaded from a YAML file, or read from
//! `JOBFORGE_*` environment variables. Durations are expressed in seconds
//! (fractional values allowed) in both files and the environment.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted value for any configured duration.
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Errors that can occur while building configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the consumer pipeline and the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Consumer settings
    /// Names of the queues to consume, one fetch thread each.
    pub queues: Vec<String>,
    /// Optional prefix applied to every queue name (e.g. an environment name).
    pub queue_prefix: Option<String>,
    /// Upper bound on a single blocking fetch call.
    #[serde(with = "duration_secs")]
    pub fetch_timeout: Duration,

    // Batching settings
    /// Number of units that triggers an immediate flush.
    pub batch_size: usize,
    /// Idle time after the last add before a partial batch is flushed.
    #[serde(with = "duration_secs")]
    pub batch_timeout: Duration,

    // Duplicate detection
    /// How long a message id is remembered. `None` disables detection.
    #[serde(with = "optional_duration_secs")]
    pub dedupe_ttl: Option<Duration>,
    /// Maximum number of remembered message ids.
    pub dedupe_capacity: usize,

    // Pool settings
    /// Number of worker processes kept alive.
    pub num_workers: usize,
    /// Bounded wait of the master event loop between housekeeping passes.
    #[serde(with = "duration_secs")]
    pub select_timeout: Duration,
    /// Grace period for workers to finish in-flight work on shutdown.
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    /// Replace a worker process after it reports a timed-out job.
    pub retire_after_timeout: bool,

    // Backend settings
    /// Redis connection URL. When unset the in-memory backend is used.
    pub redis_url: Option<String>,
    /// How long a leased Redis message may stay unacknowledged before it is
    /// put back on its queue.
    #[serde(with = "duration_secs")]
    pub visibility_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: vec!["default".to_string()],
            queue_prefix: None,
            fetch_timeout: Duration::from_secs(1),

            batch_size: 50,
            batch_timeout: Duration::from_secs(20),

            dedupe_ttl: Some(Duration::from_secs(30)),
            dedupe_capacity: 100_000,

            num_workers: 4,
            select_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            retire_after_timeout: false,

            redis_url: None,
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// Missing keys fall back to their defaults. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBFORGE_QUEUES`: Comma-separated queue names (default: default)
    /// - `JOBFORGE_QUEUE_PREFIX`: Prefix applied to all queue names
    /// - `JOBFORGE_FETCH_TIMEOUT_SECS`: Blocking fetch bound (default: 1)
    /// - `JOBFORGE_BATCH_SIZE`: Units per batch (default: 50)
    /// - `JOBFORGE_BATCH_TIMEOUT_SECS`: Idle flush timeout (default: 20)
    /// - `JOBFORGE_DEDUPE_TTL_SECS`: Duplicate window, 0 disables (default: 30)
    /// - `JOBFORGE_DEDUPE_CAPACITY`: Remembered ids (default: 100000)
    /// - `JOBFORGE_NUM_WORKERS`: Worker processes (default: 4)
    /// - `JOBFORGE_SELECT_TIMEOUT_SECS`: Event loop wait (default: 1)
    /// - `JOBFORGE_SHUTDOWN_TIMEOUT_SECS`: Shutdown grace period (default: 30)
    /// - `JOBFORGE_RETIRE_AFTER_TIMEOUT`: Replace workers after a timeout (default: false)
    /// - `JOBFORGE_REDIS_URL` or `REDIS_URL`: Redis backend URL
    /// - `JOBFORGE_VISIBILITY_TIMEOUT_SECS`: Redis lease timeout (default: 300)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    ///
    /// `from_env` delegates here; tests pass a map instead of mutating the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Consumer settings
        if let Some(val) = lookup("JOBFORGE_QUEUES") {
            config.queues = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(val) = lookup("JOBFORGE_QUEUE_PREFIX") {
            config.queue_prefix = Some(val).filter(|p| !p.is_empty());
        }

        if let Some(val) = lookup("JOBFORGE_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout = parse_env_secs(&val, "JOBFORGE_FETCH_TIMEOUT_SECS")?;
        }

        // Batching settings
        if let Some(val) = lookup("JOBFORGE_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "JOBFORGE_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("JOBFORGE_BATCH_TIMEOUT_SECS") {
            config.batch_timeout = parse_env_secs(&val, "JOBFORGE_BATCH_TIMEOUT_SECS")?;
        }

        // Duplicate detection
        if let Some(val) = lookup("JOBFORGE_DEDUPE_TTL_SECS") {
            let ttl = parse_env_secs(&val, "JOBFORGE_DEDUPE_TTL_SECS")?;
            config.dedupe_ttl = Some(ttl).filter(|ttl| !ttl.is_zero());
        }

        if let Some(val) = lookup("JOBFORGE_DEDUPE_CAPACITY") {
            config.dedupe_capacity = parse_env_value(&val, "JOBFORGE_DEDUPE_CAPACITY")?;
        }

        // Pool settings
        if let Some(val) = lookup("JOBFORGE_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "JOBFORGE_NUM_WORKERS")?;
        }

        if let Some(val) = lookup("JOBFORGE_SELECT_TIMEOUT_SECS") {
            config.select_timeout = parse_env_secs(&val, "JOBFORGE_SELECT_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("JOBFORGE_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout = parse_env_secs(&val, "JOBFORGE_SHUTDOWN_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("JOBFORGE_RETIRE_AFTER_TIMEOUT") {
            config.retire_after_timeout = parse_env_bool(&val, "JOBFORGE_RETIRE_AFTER_TIMEOUT")?;
        }

        // Backend settings
        config.redis_url = lookup("JOBFORGE_REDIS_URL")
            .or_else(|| lookup("REDIS_URL"))
            .filter(|url| !url.is_empty());

        if let Some(val) = lookup("JOBFORGE_VISIBILITY_TIMEOUT_SECS") {
            config.visibility_timeout = parse_env_secs(&val, "JOBFORGE_VISIBILITY_TIMEOUT_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one queue must be configured".to_string(),
            ));
        }

        if self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "queue names cannot be empty".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.batch_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "batch_timeout must be greater than 0".to_string(),
            ));
        }

        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "fetch_timeout must be greater than 0".to_string(),
            ));
        }

        if self.dedupe_ttl.is_some() && self.dedupe_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "dedupe_capacity must be greater than 0 when deduplication is enabled".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.select_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "select_timeout must be greater than 0".to_string(),
            ));
        }

        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }

        let durations = [
            ("fetch_timeout", Some(self.fetch_timeout)),
            ("batch_timeout", Some(self.batch_timeout)),
            ("dedupe_ttl", self.dedupe_ttl),
            ("select_timeout", Some(self.select_timeout)),
            ("shutdown_timeout", Some(self.shutdown_timeout)),
            ("visibility_timeout", Some(self.visibility_timeout)),
        ];
        for (name, value) in durations {
            if value.is_some_and(|d| d > MAX_DURATION) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be at most {} seconds",
                    name,
                    MAX_DURATION.as_secs()
                )));
            }
        }

        Ok(())
    }

    /// Returns the configured queue names with the prefix applied.
    pub fn prefixed_queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| self.prefixed(q)).collect()
    }

    /// Applies the configured prefix to a single queue name.
    pub fn prefixed(&self, queue: &str) -> String {
        match &self.queue_prefix {
            Some(prefix) => format!("{}_{}", prefix, queue),
            None => queue.to_string(),
        }
    }

    /// Sets the queues to consume.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the queue prefix.
    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = Some(prefix.into());
        self
    }

    /// Sets the number of worker processes.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the idle batch timeout.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Sets the blocking fetch bound.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the event loop wait.
    pub fn with_select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the duplicate detection window. `None` disables detection.
    pub fn with_dedupe_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.dedupe_ttl = ttl;
        self
    }

    /// Replaces worker processes after they report a timed-out job.
    pub fn with_retire_after_timeout(mut self, retire: bool) -> Self {
        self.retire_after_timeout = retire;
        self
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Sets the Redis lease timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

/// Parses a non-negative number of seconds into a `Duration`.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env_value(value, key)?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment variable.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", value),
        }),
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod optional_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.queues, vec!["default".to_string()]);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.batch_timeout, Duration::from_secs(20));
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.dedupe_ttl, Some(Duration::from_secs(30)));
        assert!(!config.retire_after_timeout);
        assert!(config.redis_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new()
            .with_queues(["mail", "reports"])
            .with_queue_prefix("staging")
            .with_num_workers(8)
            .with_batch_size(10)
            .with_batch_timeout(Duration::from_millis(500))
            .with_shutdown_timeout(Duration::from_secs(5))
            .with_dedupe_ttl(None)
            .with_retire_after_timeout(true)
            .with_redis_url("redis://localhost:6379");

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_timeout, Duration::from_millis(500));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(config.dedupe_ttl.is_none());
        assert!(config.retire_after_timeout);
        assert_eq!(
            config.prefixed_queue_names(),
            vec!["staging_mail".to_string(), "staging_reports".to_string()]
        );
    }

    #[test]
    fn test_config_from_lookup() {
        let config = Config::from_lookup(lookup_from(&[
            ("JOBFORGE_QUEUES", "mail, reports ,"),
            ("JOBFORGE_BATCH_SIZE", "5"),
            ("JOBFORGE_BATCH_TIMEOUT_SECS", "0.25"),
            ("JOBFORGE_DEDUPE_TTL_SECS", "0"),
            ("JOBFORGE_NUM_WORKERS", "2"),
            ("JOBFORGE_RETIRE_AFTER_TIMEOUT", "yes"),
            ("REDIS_URL", "redis://cache:6379"),
            ("JOBFORGE_VISIBILITY_TIMEOUT_SECS", "90"),
        ]))
        .expect("config should be valid");

        assert_eq!(config.queues, vec!["mail".to_string(), "reports".to_string()]);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_timeout, Duration::from_millis(250));
        assert!(config.dedupe_ttl.is_none());
        assert_eq!(config.num_workers, 2);
        assert!(config.retire_after_timeout);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.visibility_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_config_from_lookup_invalid_value() {
        let err = Config::from_lookup(lookup_from(&[("JOBFORGE_NUM_WORKERS", "many")]))
            .expect_err("non-numeric worker count should fail");

        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "JOBFORGE_NUM_WORKERS"));
    }

    #[test]
    fn test_config_validation() {
        let config = Config::new().with_num_workers(0);
        assert!(config.validate().is_err());

        let config = Config::new().with_batch_size(0);
        assert!(config.validate().is_err());

        let config = Config::new().with_queues(Vec::<String>::new());
        assert!(config.validate().is_err());

        let config = Config::new().with_batch_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = Config::new().with_visibility_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_unbounded_durations() {
        let huge = Duration::from_secs_f64(1e18);
        assert!(Config::new().with_shutdown_timeout(huge).validate().is_err());
        assert!(Config::new().with_fetch_timeout(huge).validate().is_err());
        assert!(Config::new().with_dedupe_ttl(Some(huge)).validate().is_err());
        assert!(Config::new().with_visibility_timeout(huge).validate().is_err());
        assert!(Config::new().with_shutdown_timeout(MAX_DURATION).validate().is_ok());

        let err = Config::from_lookup(lookup_from(&[("JOBFORGE_SHUTDOWN_TIMEOUT_SECS", "1e18")]))
            .expect_err("huge shutdown timeout should fail");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "queues: [mail]\nbatch_size: 3\nbatch_timeout: 1.5\nnum_workers: 2\ndedupe_ttl: null"
        )
        .expect("write config");

        let config = Config::from_file(file.path()).expect("config should load");

        assert_eq!(config.queues, vec!["mail".to_string()]);
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.batch_timeout, Duration::from_millis(1500));
        assert_eq!(config.num_workers, 2);
        assert!(config.dedupe_ttl.is_none());
        // Unspecified keys keep their defaults
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }
}
