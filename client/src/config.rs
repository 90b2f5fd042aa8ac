//! Configuration management for the sync runtime.

use encore_engine::BackoffPolicy;
use std::env;
use std::time::Duration;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the durable queue
    pub database_url: String,
    /// Base URL of the remote API
    pub remote_url: Option<String>,
    /// Upper bound for one remote attempt
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Interval between connectivity probes
    pub probe_interval: Duration,
    /// Path probed for connectivity, relative to `remote_url`
    pub probe_path: String,
    /// Smallest probe body whose transfer time is used as downlink
    pub probe_min_throughput_bytes: usize,
    /// Delay of the sync trigger scheduled after an enqueue
    pub sync_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://encore-offline.db?mode=rwc".to_string(),
            remote_url: None,
            request_timeout: Duration::from_millis(10_000),
            backoff: BackoffPolicy::default(),
            probe_interval: Duration::from_secs(15),
            probe_path: "/health".to_string(),
            probe_min_throughput_bytes: 64 * 1024,
            sync_debounce: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Load configuration from environment variables. Unset variables keep
    /// their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = env::var("ENCORE_DATABASE_URL").unwrap_or(defaults.database_url);
        let remote_url = env::var("ENCORE_REMOTE_URL")
            .ok()
            .map(|url| url.trim_end_matches('/').to_string());

        let request_timeout = Duration::from_millis(number(
            "ENCORE_REQUEST_TIMEOUT_MS",
            defaults.request_timeout.as_millis() as u64,
        )?);
        let backoff = BackoffPolicy::new(
            number("ENCORE_BACKOFF_BASE_MS", defaults.backoff.base_ms)?,
            number("ENCORE_BACKOFF_MAX_MS", defaults.backoff.max_delay_ms)?,
        );
        let probe_interval = Duration::from_secs(number(
            "ENCORE_PROBE_INTERVAL_SECS",
            defaults.probe_interval.as_secs(),
        )?);
        let probe_path = env::var("ENCORE_PROBE_PATH").unwrap_or(defaults.probe_path);
        let probe_min_throughput_bytes = number(
            "ENCORE_PROBE_MIN_THROUGHPUT_BYTES",
            defaults.probe_min_throughput_bytes as u64,
        )? as usize;
        let sync_debounce = Duration::from_millis(number(
            "ENCORE_SYNC_DEBOUNCE_MS",
            defaults.sync_debounce.as_millis() as u64,
        )?);

        Ok(Self {
            database_url,
            remote_url,
            request_timeout,
            backoff,
            probe_interval,
            probe_path,
            probe_min_throughput_bytes,
            sync_debounce,
        })
    }

    /// The remote URL, required by hosts that talk to a server.
    pub fn require_remote_url(&self) -> Result<&str, ConfigError> {
        self.remote_url
            .as_deref()
            .ok_or(ConfigError::MissingRemoteUrl)
    }
}

fn number(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(var)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ENCORE_REMOTE_URL environment variable is required")]
    MissingRemoteUrl,

    #[error("Invalid number in {0}")]
    InvalidNumber(&'static str),
}
