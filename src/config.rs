//! Configuration types for content-sync

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Reconciliation strategy for one sync run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Only add wanted content; nothing is removed
    #[default]
    Additive,
    /// Add wanted content and remove everything else from the version
    Mirror,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Additive => write!(f, "additive"),
            SyncMode::Mirror => write!(f, "mirror"),
        }
    }
}

/// Sync behavior configuration (concurrency, backpressure, download policy)
///
/// Used as a flattened sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of downloads executed concurrently (default: 4, minimum: 2)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of downloads admitted before submission blocks (default: 1024)
    ///
    /// Must be at least `concurrency`.
    #[serde(default = "default_backlog")]
    pub backlog: usize,

    /// Record artifact URLs in the download catalog instead of fetching them
    #[serde(default)]
    pub deferred_download: bool,

    /// Reconciliation strategy (default: additive)
    #[serde(default)]
    pub mode: SyncMode,

    /// Number of content items removed per transaction (default: 1024)
    #[serde(default = "default_removal_batch_size")]
    pub removal_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            backlog: default_backlog(),
            deferred_download: false,
            mode: SyncMode::default(),
            removal_batch_size: default_removal_batch_size(),
        }
    }
}

impl SyncConfig {
    /// Check concurrency and backlog bounds
    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 2 {
            return Err(Error::config(
                "concurrency",
                format!("concurrency may not be < 2 (got {})", self.concurrency),
            ));
        }
        if self.backlog < self.concurrency {
            return Err(Error::config(
                "backlog",
                format!(
                    "backlog may not be < concurrency (backlog {}, concurrency {})",
                    self.backlog, self.concurrency
                ),
            ));
        }
        if self.removal_batch_size == 0 {
            return Err(Error::config(
                "removal_batch_size",
                "removal_batch_size must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Retry configuration for transient download failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Retry immediately, without any delay (used by tests and local transports)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Data storage locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./content-sync.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root of the content-addressed artifact store (default: "./storage")
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Scratch directory downloads are written to before commit (default: "./working")
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            storage_dir: default_storage_dir(),
            working_dir: default_working_dir(),
        }
    }
}

/// Transport settings shared by every download of a run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// User-Agent header sent with HTTP requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Whole-request timeout (None = no timeout)
    #[serde(default, with = "optional_duration_serde")]
    pub timeout: Option<Duration>,

    /// TCP connect timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Username for basic authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for basic authentication
    #[serde(default)]
    pub password: Option<String>,

    /// PEM file with an additional trusted CA certificate
    #[serde(default)]
    pub ca_certificate: Option<PathBuf>,

    /// Verify TLS certificates (default: true)
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout: None,
            connect_timeout: default_connect_timeout(),
            username: None,
            password: None,
            ca_certificate: None,
            verify_tls: true,
        }
    }
}

/// Main configuration
///
/// Sync settings are flattened so the serialized form reads
/// `{"concurrency": 4, "backlog": 1024, "deferred_download": false, "mode": "additive", ...}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Concurrency, backpressure and download policy
    #[serde(flatten)]
    pub sync: SyncConfig,

    /// Retry and backoff for transport failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Database and storage locations
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Transport (HTTP/TLS/credentials) settings
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Validate every sub-config
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                "backoff_multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_backlog() -> usize {
    1024
}

fn default_removal_batch_size() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_database_path() -> PathBuf {
    PathBuf::from("content-sync.db")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("storage")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("working")
}

fn default_user_agent() -> String {
    format!("content-sync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
