//! Configuration module for carbonsink.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Common settings (self-metrics prefix and endpoint, concurrency hint)
//! - Local data directory and file rotation
//! - ClickHouse uploader tables and timeouts
//! - TCP / UDP / pickle receivers

mod app;
mod validation;

pub use app::{
    ClickHouseConfig, CommonConfig, Config, DataConfig, ListenerConfig, LoggingConfig,
    TREE_DATE_FORMAT,
};
pub use validation::{
    ConfigError, HOST_PLACEHOLDER, METRIC_ENDPOINT_LOCAL, apply_host_template, expand_env_vars,
    local_hostname, normalize_metric_endpoint,
};

// Re-export constants
pub use app::{
    DEFAULT_CLICKHOUSE_TIMEOUT, DEFAULT_DATA_PATH, DEFAULT_FILE_INTERVAL, DEFAULT_METRIC_INTERVAL,
    DEFAULT_METRIC_PREFIX,
};
