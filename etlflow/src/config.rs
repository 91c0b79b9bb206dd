//! Engine and run configuration.

use crate::scheduler::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/etlflow";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds.
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pipeline sizing and timing.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Database connections.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

impl EngineConfig {
    /// Loads `.env`, then reads `ETLFLOW_*` and `DATABASE_*` variables over
    /// the defaults, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is out of range.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is out of range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let pipeline = PipelineConfig {
            queue_capacity: env(&lookup, "ETLFLOW_QUEUE_CAPACITY").unwrap_or(defaults.pipeline.queue_capacity),
            workers: env(&lookup, "ETLFLOW_WORKERS").or(defaults.pipeline.workers),
            batch_size: env(&lookup, "ETLFLOW_BATCH_SIZE").or(defaults.pipeline.batch_size),
            target_batch_count: env(&lookup, "ETLFLOW_TARGET_BATCH_COUNT")
                .unwrap_or(defaults.pipeline.target_batch_count),
            min_batch_size: env(&lookup, "ETLFLOW_MIN_BATCH_SIZE").unwrap_or(defaults.pipeline.min_batch_size),
            max_batch_size: env(&lookup, "ETLFLOW_MAX_BATCH_SIZE").unwrap_or(defaults.pipeline.max_batch_size),
            coalesce_limit: env(&lookup, "ETLFLOW_COALESCE_LIMIT").unwrap_or(defaults.pipeline.coalesce_limit),
            poll_interval_ms: env(&lookup, "ETLFLOW_POLL_INTERVAL_MS").unwrap_or(defaults.pipeline.poll_interval_ms),
            memory_sample_interval_ms: env(&lookup, "ETLFLOW_MEMORY_SAMPLE_INTERVAL_MS")
                .unwrap_or(defaults.pipeline.memory_sample_interval_ms),
            extractor_yield_every: env(&lookup, "ETLFLOW_EXTRACTOR_YIELD_EVERY")
                .unwrap_or(defaults.pipeline.extractor_yield_every),
            fk_retry_limit: env(&lookup, "ETLFLOW_FK_RETRY_LIMIT").unwrap_or(defaults.pipeline.fk_retry_limit),
        };

        let database = DatabaseConfig {
            url: lookup("DATABASE_URL").unwrap_or(defaults.database.url),
            metadata_url: lookup("ETLFLOW_METADATA_DATABASE_URL"),
            max_connections: env(&lookup, "DATABASE_MAX_CONNECTIONS").unwrap_or(defaults.database.max_connections),
            min_connections: env(&lookup, "DATABASE_MIN_CONNECTIONS").unwrap_or(defaults.database.min_connections),
            connect_timeout_secs: env(&lookup, "DATABASE_CONNECT_TIMEOUT")
                .unwrap_or(defaults.database.connect_timeout_secs),
            idle_timeout_secs: env(&lookup, "DATABASE_IDLE_TIMEOUT").unwrap_or(defaults.database.idle_timeout_secs),
        };

        let log = LogConfig {
            level: lookup("ETLFLOW_LOG_LEVEL").unwrap_or(defaults.log.level),
            json: env(&lookup, "ETLFLOW_LOG_JSON").unwrap_or(defaults.log.json),
        };

        let config = Self {
            pipeline,
            database,
            log,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.pipeline;
        if p.queue_capacity == 0 {
            anyhow::bail!("Pipeline queue_capacity must be greater than 0");
        }
        if p.workers == Some(0) {
            anyhow::bail!("Pipeline workers must be greater than 0");
        }
        if p.batch_size == Some(0) {
            anyhow::bail!("Pipeline batch_size must be greater than 0");
        }
        if p.target_batch_count == 0 {
            anyhow::bail!("Pipeline target_batch_count must be greater than 0");
        }
        if p.min_batch_size == 0 || p.min_batch_size > p.max_batch_size {
            anyhow::bail!(
                "Pipeline min_batch_size ({}) must be between 1 and max_batch_size ({})",
                p.min_batch_size,
                p.max_batch_size
            );
        }
        if p.coalesce_limit == 0 {
            anyhow::bail!("Pipeline coalesce_limit must be greater than 0");
        }
        if p.poll_interval_ms == 0 {
            anyhow::bail!("Pipeline poll_interval_ms must be greater than 0");
        }

        let d = &self.database;
        if d.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if d.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if d.min_connections > d.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                d.min_connections,
                d.max_connections
            );
        }
        Ok(())
    }
}

fn env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Ignoring unparseable configuration value");
            None
        }
    }
}

/// Sizing and timing of the batched pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each inter-stage queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Worker pool size; `None` means available cores minus one.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Fixed batch size; `None` derives it from the extract length.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Number of batches to aim for when deriving the batch size.
    #[serde(default = "default_target_batch_count")]
    pub target_batch_count: usize,
    /// Lower bound of a derived batch size.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    /// Upper bound of a derived batch size, and the size used when the
    /// extract length is unknown.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum number of batch results the loader coalesces per flush.
    #[serde(default = "default_coalesce_limit")]
    pub coalesce_limit: usize,
    /// How long the collector waits for a finished job before checking for
    /// new submissions.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval between memory samples.
    #[serde(default = "default_memory_sample_interval_ms")]
    pub memory_sample_interval_ms: u64,
    /// The extractor yields to the scheduler after this many rows.
    #[serde(default = "default_extractor_yield_every")]
    pub extractor_yield_every: usize,
    /// Flush attempts that may drop rows with dangling foreign keys before
    /// the violation becomes fatal.
    #[serde(default = "default_fk_retry_limit")]
    pub fk_retry_limit: usize,
}

fn default_queue_capacity() -> usize {
    16
}

fn default_target_batch_count() -> usize {
    100
}

fn default_min_batch_size() -> usize {
    10
}

fn default_max_batch_size() -> usize {
    10_000
}

fn default_coalesce_limit() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_memory_sample_interval_ms() -> u64 {
    1_000
}

fn default_extractor_yield_every() -> usize {
    256
}

fn default_fk_retry_limit() -> usize {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: None,
            batch_size: None,
            target_batch_count: default_target_batch_count(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            coalesce_limit: default_coalesce_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            memory_sample_interval_ms: default_memory_sample_interval_ms(),
            extractor_yield_every: default_extractor_yield_every(),
            fk_retry_limit: default_fk_retry_limit(),
        }
    }
}

impl PipelineConfig {
    /// Returns the worker pool size.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map_or(1, |n| n.get().saturating_sub(1))
                .max(1)
        })
    }

    /// Returns the collector poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the memory sampling interval.
    #[must_use]
    pub fn memory_sample_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sample_interval_ms)
    }

    /// Sets a fixed worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Sets a fixed batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Target store URL.
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Metadata store URL; defaults to the target store.
    #[serde(default)]
    pub metadata_url: Option<String>,
    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum pool connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Idle timeout in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_DATABASE_MAX_CONNECTIONS
}

fn default_min_connections() -> u32 {
    DEFAULT_DATABASE_MIN_CONNECTIONS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS
}

fn default_idle_timeout() -> u64 {
    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            metadata_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Returns the metadata store URL.
    #[must_use]
    pub fn metadata_url(&self) -> &str {
        self.metadata_url.as_deref().unwrap_or(&self.url)
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level for the `etlflow` target.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// How a step is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Single-task walk over batches.
    Sync,
    /// Queue-connected stages with a worker pool.
    #[default]
    Pipeline,
}

/// What one run should do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Step names or tags to run; empty means all.
    #[serde(default)]
    pub include: Vec<String>,
    /// Step names or tags to skip; wins over `include`.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// First step to run, in execution order.
    #[serde(default)]
    pub start: Option<String>,
    /// Last step to run, in execution order.
    #[serde(default)]
    pub until: Option<String>,
    /// Reprocess inputs even when already processed.
    #[serde(default)]
    pub retry: bool,
    /// What happens to later steps when one fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Execution mode for every step.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Batch-size override for every step without its own.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Explicit run id.
    #[serde(default)]
    pub run_id: Option<Uuid>,
}

impl RunConfig {
    /// Creates a run configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step name or tag to run.
    #[must_use]
    pub fn include(mut self, selector: impl Into<String>) -> Self {
        self.include.push(selector.into());
        self
    }

    /// Adds a step name or tag to skip.
    #[must_use]
    pub fn exclude(mut self, selector: impl Into<String>) -> Self {
        self.exclude.push(selector.into());
        self
    }

    /// Sets the first step.
    #[must_use]
    pub fn start(mut self, step: impl Into<String>) -> Self {
        self.start = Some(step.into());
        self
    }

    /// Sets the last step.
    #[must_use]
    pub fn until(mut self, step: impl Into<String>) -> Self {
        self.until = Some(step.into());
        self
    }

    /// Reprocesses repeats.
    #[must_use]
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Sets the execution mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the batch-size override.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Sets an explicit run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.pipeline.worker_count() >= 1);
        assert_eq!(config.database.metadata_url(), DEFAULT_DATABASE_URL);
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("ETLFLOW_WORKERS", "3"),
            ("ETLFLOW_BATCH_SIZE", "50"),
            ("DATABASE_URL", "postgresql://db/etl"),
            ("ETLFLOW_METADATA_DATABASE_URL", "postgresql://db/meta"),
            ("ETLFLOW_LOG_JSON", "true"),
        ]))
        .unwrap();

        assert_eq!(config.pipeline.worker_count(), 3);
        assert_eq!(config.pipeline.batch_size, Some(50));
        assert_eq!(config.database.url, "postgresql://db/etl");
        assert_eq!(config.database.metadata_url(), "postgresql://db/meta");
        assert!(config.log.json);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = EngineConfig::from_lookup(lookup(&[("ETLFLOW_QUEUE_CAPACITY", "lots")])).unwrap();
        assert_eq!(config.pipeline.queue_capacity, default_queue_capacity());
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("ETLFLOW_WORKERS", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[
            ("ETLFLOW_MIN_BATCH_SIZE", "500"),
            ("ETLFLOW_MAX_BATCH_SIZE", "100"),
        ]))
        .is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("ETLFLOW_POLL_INTERVAL_MS", "0")])).is_err());

        let mut config = EngineConfig::default();
        config.pipeline.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"pipeline": {"queue_capacity": 4}}"#).unwrap();
        assert_eq!(config.pipeline.queue_capacity, 4);
        assert_eq!(config.pipeline.fk_retry_limit, 3);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_run_config_builder() {
        let run = RunConfig::new()
            .include("nightly")
            .exclude("slow")
            .with_retry(true)
            .with_mode(ExecutionMode::Sync);
        assert_eq!(run.include, vec!["nightly"]);
        assert!(run.retry);
        assert_eq!(run.mode, ExecutionMode::Sync);
        assert_eq!(run.failure_policy, FailurePolicy::default());
    }
}
