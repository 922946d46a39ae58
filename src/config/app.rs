//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::validation::{
    ConfigError, METRIC_ENDPOINT_LOCAL, apply_host_template, expand_env_vars,
    normalize_metric_endpoint,
};

// =============================================================================
// Constants
// =============================================================================

/// Default self-metrics prefix.
pub const DEFAULT_METRIC_PREFIX: &str = "carbon.agents.{host}";

/// Default self-metrics interval (1 minute).
pub const DEFAULT_METRIC_INTERVAL: Duration = Duration::from_secs(60);

/// Default local data directory.
pub const DEFAULT_DATA_PATH: &str = "/data/carbon-clickhouse/";

/// Default rotation interval for local files (1 second).
pub const DEFAULT_FILE_INTERVAL: Duration = Duration::from_secs(1);

/// Default ClickHouse insert timeout (1 minute).
pub const DEFAULT_CLICKHOUSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Date format of `clickhouse.tree-date`.
pub const TREE_DATE_FORMAT: &str = "%Y-%m-%d";

// =============================================================================
// Common
// =============================================================================

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CommonConfig {
    /// Prefix for self-metrics; `{host}` is replaced with the hostname.
    pub metric_prefix: String,

    /// `local`, or a `tcp://` / `udp://` Graphite endpoint.
    pub metric_endpoint: String,

    /// Self-metrics sampling interval (default: 1m).
    #[serde(with = "humantime_serde")]
    pub metric_interval: Duration,

    /// Concurrency hint; 0 means all available cores.
    pub max_cpu: usize,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
            metric_endpoint: METRIC_ENDPOINT_LOCAL.to_string(),
            metric_interval: DEFAULT_METRIC_INTERVAL,
            max_cpu: 1,
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Logging settings. `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Default filter directive (default: "info").
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// =============================================================================
// Data
// =============================================================================

/// Local durable storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DataConfig {
    /// Directory for locally buffered files.
    pub path: PathBuf,

    /// File rotation interval (default: 1s).
    #[serde(with = "humantime_serde")]
    pub file_interval: Duration,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATA_PATH),
            file_interval: DEFAULT_FILE_INTERVAL,
        }
    }
}

// =============================================================================
// ClickHouse
// =============================================================================

/// Uploader destination and table layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClickHouseConfig {
    /// HTTP interface URL.
    pub url: String,

    /// Primary points table.
    pub data_table: String,

    /// Additional points tables.
    pub data_tables: Vec<String>,

    /// Points tables that store reversed paths.
    pub reverse_data_tables: Vec<String>,

    /// Timeout for points inserts (default: 1m).
    #[serde(with = "humantime_serde")]
    pub data_timeout: Duration,

    /// Metric tree table; empty disables tree inserts.
    pub tree_table: String,

    /// Reversed metric tree table; empty disables.
    pub reverse_tree_table: String,

    /// Date written into tree rows (YYYY-MM-DD).
    pub tree_date: String,

    /// Timeout for tree inserts (default: 1m).
    #[serde(with = "humantime_serde")]
    pub tree_timeout: Duration,

    /// Files uploaded concurrently.
    pub threads: usize,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123/".to_string(),
            data_table: "graphite".to_string(),
            data_tables: Vec::new(),
            reverse_data_tables: Vec::new(),
            data_timeout: DEFAULT_CLICKHOUSE_TIMEOUT,
            tree_table: "graphite_tree".to_string(),
            reverse_tree_table: String::new(),
            tree_date: "2016-11-01".to_string(),
            tree_timeout: DEFAULT_CLICKHOUSE_TIMEOUT,
            threads: 1,
        }
    }
}

impl ClickHouseConfig {
    /// Data tables the uploader writes to: `data-tables` plus `data-table`
    /// when it is set and not already listed.
    pub fn upload_data_tables(&self) -> Vec<String> {
        let mut tables = self.data_tables.clone();
        if !self.data_table.is_empty() && !tables.contains(&self.data_table) {
            tables.push(self.data_table.clone());
        }
        tables
    }

    /// Parsed `tree-date`.
    pub fn tree_date(&self) -> Result<NaiveDate, ConfigError> {
        NaiveDate::parse_from_str(&self.tree_date, TREE_DATE_FORMAT).map_err(|e| {
            ConfigError::ValidationError(format!(
                "clickhouse tree-date {:?}: {}",
                self.tree_date, e
            ))
        })
    }
}

// =============================================================================
// Receivers
// =============================================================================

/// Listener settings shared by every receiver kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenerConfig {
    /// Start this receiver (default: true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// `host:port`; `:port` listens on all interfaces.
    #[serde(default)]
    pub listen: String,
}

impl ListenerConfig {
    fn new(listen: &str) -> Self {
        Self {
            enabled: true,
            listen: listen.to_string(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_plain_listener() -> ListenerConfig {
    ListenerConfig::new(":2003")
}

fn default_pickle_listener() -> ListenerConfig {
    ListenerConfig::new(":2004")
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Process-wide settings.
    #[serde(default)]
    pub common: CommonConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Local storage settings.
    #[serde(default)]
    pub data: DataConfig,

    /// Uploader settings.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Plaintext stream receiver.
    #[serde(default = "default_plain_listener")]
    pub tcp: ListenerConfig,

    /// Plaintext datagram receiver.
    #[serde(default = "default_plain_listener")]
    pub udp: ListenerConfig,

    /// Pickle stream receiver.
    #[serde(default = "default_pickle_listener")]
    pub pickle: ListenerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            logging: LoggingConfig::default(),
            data: DataConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            tcp: default_plain_listener(),
            udp: default_plain_listener(),
            pickle: default_pickle_listener(),
        }
    }
}

impl Config {
    /// Read and parse a YAML file without resolving it.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse YAML text. Empty input yields the defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Load, template and validate a configuration file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::read(path)?.resolve(super::local_hostname().as_deref())
    }

    /// Apply hostname templating and endpoint normalization, then validate.
    ///
    /// Consumes `self` so a failed resolve never leaves a half-updated value behind.
    pub fn resolve(mut self, hostname: Option<&str>) -> Result<Self, ConfigError> {
        self.common.metric_prefix = apply_host_template(&self.common.metric_prefix, hostname);
        self.common.metric_endpoint = normalize_metric_endpoint(&self.common.metric_endpoint)?;
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "data path must not be empty".to_string(),
            ));
        }

        if self.data.file_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "data file-interval must be positive".to_string(),
            ));
        }

        if self.common.metric_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "common metric-interval must be positive".to_string(),
            ));
        }

        if self.clickhouse.threads == 0 {
            return Err(ConfigError::ValidationError(
                "clickhouse threads must be positive".to_string(),
            ));
        }

        self.clickhouse.tree_date()?;

        for (name, listener) in [("tcp", &self.tcp), ("udp", &self.udp), ("pickle", &self.pickle)] {
            if listener.enabled && listener.listen.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{name} listen address must not be empty"
                )));
            }
        }

        Ok(())
    }

    /// Whether self-metrics go into the local write pipeline.
    pub fn metrics_are_local(&self) -> bool {
        self.common.metric_endpoint == METRIC_ENDPOINT_LOCAL
    }
}
