use std::env;
use std::time::Duration;

use crate::awareness::OUTDATED_TIMEOUT;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a number, got `{value}`")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be a boolean, got `{value}`")]
    InvalidBool { key: &'static str, value: String },
}

/// Options forwarded to every document replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaOptions {
    /// Collect deleted content. Disable to keep history for snapshots.
    pub gc: bool,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self { gc: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Instance name, used in logs.
    pub name: Option<String>,
    pub port: u16,
    pub address: String,
    /// Liveness interval and idle-connection timeout.
    pub timeout: Duration,
    /// Quiet period before a changed document is stored.
    pub debounce: Duration,
    /// Upper bound on how long a store can be postponed.
    pub max_debounce: Duration,
    /// Suppress the startup log line.
    pub quiet: bool,
    pub replica: ReplicaOptions,
    /// Presence entries older than this are evicted.
    pub awareness_timeout: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: None,
            port: 80,
            address: "0.0.0.0".to_owned(),
            timeout: Duration::from_millis(30_000),
            debounce: Duration::from_millis(2_000),
            max_debounce: Duration::from_millis(10_000),
            quiet: false,
            replica: ReplicaOptions::default(),
            awareness_timeout: OUTDATED_TIMEOUT,
        }
    }
}

impl Configuration {
    /// Reads `SYNC_*` variables, loading a `.env` file first if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(value) => value.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| ConfigError::InvalidNumber { key, value }),
                None => Ok(default),
            }
        };
        let flag = |key: &'static str, default: bool| -> Result<bool, ConfigError> {
            match lookup(key) {
                Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    _ => Err(ConfigError::InvalidBool { key, value }),
                },
                None => Ok(default),
            }
        };

        let port = match lookup("SYNC_PORT") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidNumber { key: "SYNC_PORT", value })?,
            None => defaults.port,
        };

        Ok(Self {
            name: lookup("SYNC_NAME").or(defaults.name),
            port,
            address: lookup("SYNC_ADDRESS").unwrap_or(defaults.address),
            timeout: millis("SYNC_TIMEOUT_MS", defaults.timeout)?,
            debounce: millis("SYNC_DEBOUNCE_MS", defaults.debounce)?,
            max_debounce: millis("SYNC_MAX_DEBOUNCE_MS", defaults.max_debounce)?,
            quiet: flag("SYNC_QUIET", defaults.quiet)?,
            replica: ReplicaOptions { gc: flag("SYNC_GC", defaults.replica.gc)? },
            awareness_timeout: millis("SYNC_AWARENESS_TIMEOUT_MS", defaults.awareness_timeout)?,
        })
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
