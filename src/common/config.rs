//! Configuration for volwatch components

use crate::common::{parse_duration, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix, e.g. `VOLWATCH_WATCHER__QUERY_BURST=50`
const ENV_PREFIX: &str = "VOLWATCH";

/// One query per ~17 minutes; anything slower is a misconfiguration
const MIN_QUERIES_PER_SECOND: f64 = 0.001;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Volume watcher tunables
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "volwatch-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            watcher: WatcherConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load config from an optional TOML file, then apply `VOLWATCH_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.watcher.validate()?;
        Ok(config)
    }
}

/// Volume watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Upper bound on blocking volume-table queries per second
    #[serde(default = "default_queries_per_second")]
    pub limit_state_queries_per_second: f64,

    /// Burst allowance for the query limiter
    #[serde(default = "default_query_burst")]
    pub query_burst: u32,

    /// Window over which claim updates from all volumes are coalesced, e.g. `250ms`
    #[serde(default = "default_batch_duration")]
    pub cross_volume_update_batch_duration: String,

    /// Period at which every claimed volume is re-notified, which is what
    /// retries failed detaches
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval: String,
}

fn default_queries_per_second() -> f64 {
    100.0
}
fn default_query_burst() -> u32 {
    100
}
fn default_batch_duration() -> String {
    "250ms".to_string()
}
fn default_rescan_interval() -> String {
    "5m".to_string()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            limit_state_queries_per_second: default_queries_per_second(),
            query_burst: default_query_burst(),
            cross_volume_update_batch_duration: default_batch_duration(),
            rescan_interval: default_rescan_interval(),
        }
    }
}

impl WatcherConfig {
    pub fn batch_duration(&self) -> Result<Duration> {
        parse_duration(&self.cross_volume_update_batch_duration)
    }

    pub fn rescan_duration(&self) -> Result<Duration> {
        parse_duration(&self.rescan_interval)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit_state_queries_per_second < MIN_QUERIES_PER_SECOND
            || !self.limit_state_queries_per_second.is_finite()
        {
            return Err(Error::InvalidConfig(format!(
                "limit_state_queries_per_second must be at least {}, got {}",
                MIN_QUERIES_PER_SECOND, self.limit_state_queries_per_second
            )));
        }
        if self.query_burst == 0 {
            return Err(Error::InvalidConfig("query_burst must be at least 1".into()));
        }
        if self.batch_duration()?.is_zero() {
            return Err(Error::InvalidConfig(
                "cross_volume_update_batch_duration must be non-zero".into(),
            ));
        }
        if self.rescan_duration()?.is_zero() {
            return Err(Error::InvalidConfig("rescan_interval must be non-zero".into()));
        }
        Ok(())
    }
}
