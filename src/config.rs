//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides; command
//! line flags are applied on top by the binary.

use crate::ship::{LabelCollision, ShipError, ShipOptions};
use crate::storage::OpenMode;
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub ship: ShipConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local store to read from
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_dir")]
    pub dir: String,

    /// Open writable so the unflushed head is shipped too
    #[serde(default)]
    pub write_mode: bool,

    /// In write mode, skip the directory lock (e.g. a stale `LOCK` file)
    #[serde(default)]
    pub no_lockfile: bool,
}

fn default_source_dir() -> String {
    "./data".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dir: default_source_dir(),
            write_mode: false,
            no_lockfile: false,
        }
    }
}

/// Remote-write endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_url")]
    pub url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_url() -> String {
    "http://localhost:9090/api/v1/write".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: default_remote_url(),
            timeout_secs: default_timeout(),
        }
    }
}

/// What to ship and how
#[derive(Debug, Clone, Deserialize)]
pub struct ShipConfig {
    /// Lower bound in milliseconds; unset means the beginning of time
    #[serde(default)]
    pub min_time: Option<i64>,

    /// Upper bound in milliseconds; unset means now
    #[serde(default)]
    pub max_time: Option<i64>,

    #[serde(default = "default_partition")]
    pub partition_secs: i64,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    #[serde(default)]
    pub external_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub label_collision: LabelCollision,
}

fn default_partition() -> i64 {
    3600 // 1 hour
}

fn default_concurrency() -> usize {
    4
}

fn default_max_batch_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

impl Default for ShipConfig {
    fn default() -> Self {
        Self {
            min_time: None,
            max_time: None,
            partition_secs: default_partition(),
            concurrency: default_concurrency(),
            max_batch_bytes: default_max_batch_bytes(),
            external_labels: BTreeMap::new(),
            label_collision: LabelCollision::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn label_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid label name regex"))
}

/// Whether `name` is a valid Prometheus label name
pub fn is_valid_label_name(name: &str) -> bool {
    label_name_regex().is_match(name)
}

/// Parse a `name=value` external label
pub fn parse_external_label(s: &str) -> Result<(String, String), ConfigError> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| ConfigError::Invalid(format!("external label {:?} is not name=value", s)))?;

    if !is_valid_label_name(name) {
        return Err(ConfigError::Invalid(format!(
            "invalid external label name {:?}",
            name
        )));
    }

    Ok((name.to_string(), value.to_string()))
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tsdb-shipper").join("config.toml")),
            Some(PathBuf::from("./tsdb-shipper.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("TSDB_SHIPPER_SOURCE_DIR") {
            self.source.dir = dir;
        }

        if let Ok(url) = std::env::var("TSDB_SHIPPER_REMOTE_URL") {
            self.remote.url = url;
        }

        if let Ok(concurrency) = std::env::var("TSDB_SHIPPER_CONCURRENCY") {
            match concurrency.parse() {
                Ok(n) => self.ship.concurrency = n,
                Err(_) => tracing::warn!(
                    value = %concurrency,
                    "Ignoring non-numeric TSDB_SHIPPER_CONCURRENCY"
                ),
            }
        }

        if let Ok(level) = std::env::var("TSDB_SHIPPER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TSDB_SHIPPER_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Check values that cannot be expressed in the types
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote_url()?;

        if self.ship.concurrency == 0 {
            return Err(ConfigError::Invalid("ship.concurrency must be at least 1".into()));
        }
        if self.ship.max_batch_bytes == 0 {
            return Err(ConfigError::Invalid(
                "ship.max_batch_bytes must be at least 1".into(),
            ));
        }
        if self.remote.timeout_secs == 0 {
            return Err(ConfigError::Invalid("remote.timeout_secs must be at least 1".into()));
        }
        if let (Some(min), Some(max)) = (self.ship.min_time, self.ship.max_time) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "ship.min_time {} is after ship.max_time {}",
                    min, max
                )));
            }
        }
        if let Some(name) = self
            .ship
            .external_labels
            .keys()
            .find(|name| !is_valid_label_name(name))
        {
            return Err(ConfigError::Invalid(format!(
                "invalid external label name {:?}",
                name
            )));
        }

        Ok(())
    }

    fn remote_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.remote.url)
            .map_err(|e| ConfigError::Invalid(format!("remote.url {:?}: {}", self.remote.url, e)))?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::Invalid(format!(
                "remote.url must be http or https, got {:?}",
                other
            ))),
        }
    }

    /// How the source store should be opened
    pub fn open_mode(&self) -> OpenMode {
        match (self.source.write_mode, self.source.no_lockfile) {
            (false, _) => OpenMode::ReadOnly,
            (true, false) => OpenMode::Writable,
            (true, true) => OpenMode::WritableUnlocked,
        }
    }

    /// Validated pipeline settings
    pub fn ship_options(&self) -> Result<ShipOptions, ConfigError> {
        self.validate()?;

        let mut options = ShipOptions::new(self.remote_url()?);
        if let Some(min) = self.ship.min_time {
            options.mint = min;
        }
        if let Some(max) = self.ship.max_time {
            options.maxt = max;
        }
        options.partition_secs = self.ship.partition_secs;
        options.concurrency = self.ship.concurrency;
        options.max_batch_bytes = self.ship.max_batch_bytes;
        options.timeout = Duration::from_secs(self.remote.timeout_secs);
        options.external_labels = self
            .ship
            .external_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        options.label_collision = self.ship.label_collision;

        Ok(options)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ShipError {
    fn from(err: ConfigError) -> Self {
        ShipError::Configuration(err.to_string())
    }
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tsdb-shipper Configuration
#
# Environment variables override these settings:
# - TSDB_SHIPPER_SOURCE_DIR
# - TSDB_SHIPPER_REMOTE_URL
# - TSDB_SHIPPER_CONCURRENCY
# - TSDB_SHIPPER_LOG_LEVEL
# - TSDB_SHIPPER_LOG_FORMAT
#
# Command line flags override both.

[source]
# Store directory to read blocks from
dir = "./data"

# Open the store writable and ship the unflushed head as well
write_mode = false

# In write mode, do not take the store's LOCK file. Only for stores no other
# process is writing, e.g. one left locked by a killed shipper
no_lockfile = false

[remote]
# Remote-write endpoint
url = "http://localhost:9090/api/v1/write"

# Per-request timeout (seconds)
timeout_secs = 30

[ship]
# Time bounds in milliseconds since epoch (default: everything up to now)
# min_time = 0
# max_time = 1700000000000

# Window width (seconds)
partition_secs = 3600

# Concurrent senders
concurrency = 4

# Approximate encoded bytes per write request
max_batch_bytes = 1048576

# What to do when an external label collides with a series label:
# keep (ship both), prefer-external, prefer-series
label_collision = "keep"

[ship.external_labels]
# cluster = "eu-1"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
