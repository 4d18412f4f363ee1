//! Configuration management for mailship
//!
//! Handles loading and validation of mailship.toml configuration files and
//! provisioning of the spool directory that holds reader bookmarks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Config file name looked up in the etc directory candidates.
pub const CONFIG_FILE_NAME: &str = "mailship.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,

    /// Log reader settings
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Line parser settings
    #[serde(default)]
    pub parser: ParserConfig,

    /// Document store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Flush cycle timing
    #[serde(default)]
    pub shipper: ShipperConfig,
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Spool directory; bookmarks live under `<spool>/.bookmark`
    #[serde(default = "default_spool")]
    pub spool: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            spool: default_spool(),
        }
    }
}

impl GeneralConfig {
    /// Directory holding reader bookmarks.
    #[must_use]
    pub fn bookmark_dir(&self) -> PathBuf {
        self.spool.join(".bookmark")
    }
}

fn default_spool() -> PathBuf {
    PathBuf::from("/var/spool/log-ship")
}

/// Log reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Log file to ship
    #[serde(default = "default_reader_file")]
    pub file: PathBuf,

    /// Maximum lines per batch
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Keep polling at end of file instead of stopping
    #[serde(default = "default_true")]
    pub follow: bool,

    /// Poll interval at end of file, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            file: default_reader_file(),
            batch_limit: default_batch_limit(),
            follow: true,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_reader_file() -> PathBuf {
    PathBuf::from("/var/log/maillog")
}

fn default_batch_limit() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    1000
}

/// Line parser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Program-name prefix of the monitored service family
    #[serde(default = "default_family")]
    pub family: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            family: default_family(),
        }
    }
}

fn default_family() -> String {
    "postfix".to_string()
}

/// Document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints, tried in order
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    /// Index holding per-transaction documents
    #[serde(default = "default_index")]
    pub index: String,

    /// Maximum orphan documents fetched per cycle (defaults to 3x batch_limit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Field queried when resolving orphans
    #[serde(default = "default_qid_field")]
    pub qid_field: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            index: default_index(),
            page_size: None,
            qid_field: default_qid_field(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_hosts() -> Vec<String> {
    vec!["http://127.0.0.1:9200".to_string()]
}

fn default_index() -> String {
    "postfix-orphan".to_string()
}

fn default_qid_field() -> String {
    "qid".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Flush cycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipperConfig {
    /// Wait before re-running a failed cycle, in seconds
    #[serde(default = "default_delay_secs")]
    pub retry_delay_secs: u64,

    /// Wait after a successful write before acknowledging the reader, in seconds
    #[serde(default = "default_delay_secs")]
    pub settle_delay_secs: u64,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_delay_secs(),
            settle_delay_secs: default_delay_secs(),
        }
    }
}

impl ShipperConfig {
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

fn default_delay_secs() -> u64 {
    15
}

impl Config {
    /// Load configuration from `<etc_dir>/mailship.toml`, falling back to
    /// `/etc/mailship.toml`. The first readable candidate wins.
    pub fn load(etc_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates = config_candidates(etc_dir);
        for path in &candidates {
            let Ok(text) = std::fs::read_to_string(path) else {
                continue;
            };
            tracing::debug!(path = %path.display(), "Loading config");
            let config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            config.validate()?;
            return Ok(config);
        }
        Err(ConfigError::NotFound { candidates })
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::NotFound {
            candidates: vec![path.to_path_buf()],
        })?;
        let config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text without validating it.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reject settings that would stall or break the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reader.batch_limit == 0 {
            return Err(ConfigError::Invalid(
                "reader.batch_limit must be >= 1".to_string(),
            ));
        }
        if self.store.hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "store.hosts must list at least one host".to_string(),
            ));
        }
        if self.store.index.trim().is_empty() {
            return Err(ConfigError::Invalid("store.index must not be empty".to_string()));
        }
        if self.store.page_size == Some(0) {
            return Err(ConfigError::Invalid("store.page_size must be >= 1".to_string()));
        }
        if self.parser.family.is_empty() {
            return Err(ConfigError::Invalid("parser.family must not be empty".to_string()));
        }
        Ok(())
    }

    /// Orphan lookup page size.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.store
            .page_size
            .unwrap_or_else(|| self.reader.batch_limit.saturating_mul(3))
    }
}

fn config_candidates(etc_dir: Option<&Path>) -> Vec<PathBuf> {
    let system = Path::new("/etc");
    let mut candidates = Vec::with_capacity(2);
    if let Some(dir) = etc_dir {
        candidates.push(dir.join(CONFIG_FILE_NAME));
    }
    if etc_dir != Some(system) {
        candidates.push(system.join(CONFIG_FILE_NAME));
    }
    candidates
}

/// Create the spool directory (and its parent) when missing and verify it
/// is writable.
pub fn prepare_spool_dir(spool: &Path) -> Result<(), ConfigError> {
    let spool_err = |reason: String| ConfigError::Spool {
        path: spool.to_path_buf(),
        reason,
    };

    if !spool.is_dir() {
        if spool.exists() {
            return Err(spool_err("exists but is not a directory".to_string()));
        }
        tracing::info!(spool = %spool.display(), "Creating spool directory");
        std::fs::create_dir_all(spool).map_err(|e| spool_err(e.to_string()))?;
    }

    let probe = spool.join(".tmp");
    std::fs::write(&probe, b"write test").map_err(|e| spool_err(format!("not writable: {e}")))?;
    std::fs::remove_file(&probe).map_err(|e| spool_err(e.to_string()))?;
    Ok(())
}
