//! Configuration management for the storage engine and its worker process.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub reindex: ReindexConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_pool_min_size")]
    pub pool_min_size: u32,
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_seconds: u64,

    /// Maximum query execution time in seconds. Queries exceeding this are
    /// terminated. Default: 300
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_seconds: u64,
    /// Maximum time to wait for a lock in seconds; fail fast beyond it.
    /// Default: 30
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Whether superseded versions are retained as history by default.
    /// Per-request policy can override.
    #[serde(default = "default_true")]
    pub keep_history_default: bool,
    /// Whether an upsert may create a missing resource by default.
    #[serde(default = "default_true")]
    pub allow_create_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReindexConfig {
    /// Local lease ceiling for the worker, and the deployment ceiling for
    /// non-terminal jobs. Default: 1
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Lease expiry threshold in seconds. Default: 60
    #[serde(default = "default_heartbeat_threshold")]
    pub heartbeat_threshold_seconds: u64,
    /// Worker loop cadence in seconds. Default: 5
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Starting batch size; the throttle oracle may shrink it. Default: 100
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Optional JSON file with search-parameter definitions to seed the
    /// worker's registry.
    #[serde(default)]
    pub parameters_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,
}

impl Config {
    /// Load configuration from an optional `FLINT_CONFIG` file plus
    /// `FLINT__`-prefixed environment variables; environment wins.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("FLINT_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("FLINT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.reindex.max_concurrent_jobs == 0 {
            return Err("reindex.max_concurrent_jobs must be at least 1".to_string());
        }
        if self.reindex.batch_size == 0 {
            return Err("reindex.batch_size must be at least 1".to_string());
        }
        if self.reindex.poll_interval_seconds == 0 {
            return Err("reindex.poll_interval_seconds must be at least 1".to_string());
        }
        if self.database.pool_max_size < self.database.pool_min_size {
            return Err("database.pool_max_size must be >= pool_min_size".to_string());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            store: StoreConfig::default(),
            reindex: ReindexConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_min_size: default_pool_min_size(),
            pool_max_size: default_pool_max_size(),
            pool_timeout_seconds: default_pool_timeout(),
            statement_timeout_seconds: default_statement_timeout(),
            lock_timeout_seconds: default_lock_timeout(),
        }
    }
}

impl StoreConfig {
    /// Baseline upsert policy for requests that don't override it.
    pub fn default_upsert_options(&self) -> crate::db::UpsertOptions {
        crate::db::UpsertOptions::new()
            .allow_create(self.allow_create_default)
            .keep_history(self.keep_history_default)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            keep_history_default: true,
            allow_create_default: true,
        }
    }
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            heartbeat_threshold_seconds: default_heartbeat_threshold(),
            poll_interval_seconds: default_poll_interval(),
            batch_size: default_batch_size(),
            parameters_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl From<&ReindexConfig> for crate::reindex::ReindexWorkerConfig {
    fn from(config: &ReindexConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            poll_interval: std::time::Duration::from_secs(config.poll_interval_seconds.max(1)),
            heartbeat_threshold: chrono::Duration::seconds(
                config.heartbeat_threshold_seconds.max(1) as i64,
            ),
        }
    }
}

fn default_database_url() -> String {
    "postgres://localhost:5432/flint".to_string()
}

fn default_pool_min_size() -> u32 {
    1
}

fn default_pool_max_size() -> u32 {
    5
}

fn default_pool_timeout() -> u64 {
    30
}

fn default_statement_timeout() -> u64 {
    300
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_heartbeat_threshold() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reindex.max_concurrent_jobs, 1);
        assert_eq!(config.reindex.heartbeat_threshold_seconds, 60);
        assert_eq!(config.reindex.poll_interval_seconds, 5);
        assert_eq!(config.reindex.batch_size, 100);
        assert!(config.store.keep_history_default);
        assert!(config.store.allow_create_default);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = Config::default();
        config.reindex.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn store_defaults_flow_into_upsert_options() {
        let store = StoreConfig {
            keep_history_default: false,
            allow_create_default: true,
        };
        let options = store.default_upsert_options();
        assert!(options.allow_create);
        assert!(!options.keep_history);
        assert!(options.if_match.is_none());
    }
}
