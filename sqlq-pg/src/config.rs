//! Database configuration - TOML file plus environment overrides
//!
//! ```toml
//! [database]
//! url = "postgres://localhost/payments"
//! max_connections = 5
//!
//! [database.timeouts]
//! default_query_timeout_ms = 10000
//! lock_timeout_ms = 15000
//! idle_in_tx_session_timeout_ms = 3600000
//! ```
//!
//! Environment variables win over the file:
//! - `DATABASE_URL`
//! - `SQLQ_MAX_CONNECTIONS`
//! - `SQLQ_DEFAULT_QUERY_TIMEOUT_MS`
//! - `SQLQ_LOCK_TIMEOUT_MS`
//! - `SQLQ_IDLE_IN_TX_SESSION_TIMEOUT_MS`

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sqlq_core::policy::{
    DEFAULT_IDLE_IN_TX_SESSION_TIMEOUT, DEFAULT_LOCK_TIMEOUT, DEFAULT_QUERY_TIMEOUT,
};
use sqlq_core::{DbError, TimeoutPolicy};

use crate::pool::DEFAULT_MAX_CONNECTIONS;

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/postgres";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config (invalid TOML): {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Policy(#[from] DbError),
}

/// Timeout settings in milliseconds, as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub default_query_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub idle_in_tx_session_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default_query_timeout_ms: DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            idle_in_tx_session_timeout_ms: DEFAULT_IDLE_IN_TX_SESSION_TIMEOUT.as_millis() as u64,
        }
    }
}

impl TryFrom<TimeoutSettings> for TimeoutPolicy {
    type Error = DbError;

    fn try_from(settings: TimeoutSettings) -> Result<Self, Self::Error> {
        TimeoutPolicy::new(
            Duration::from_millis(settings.default_query_timeout_ms),
            Duration::from_millis(settings.lock_timeout_ms),
            Duration::from_millis(settings.idle_in_tx_session_timeout_ms),
        )
    }
}

/// Connection settings for a [`Database`](crate::Database).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Deserialize)]
struct ConfigFile {
    database: DatabaseConfig,
}

fn default_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl DatabaseConfig {
    /// Load the `[database]` table from a TOML file, then apply
    /// environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.timeout_policy()?;
        Ok(config)
    }

    /// Parse the `[database]` table without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        file.database.timeout_policy()?;
        Ok(file.database)
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.timeout_policy()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.url = url;
        }
        if let Some(value) = lookup("SQLQ_MAX_CONNECTIONS") {
            self.max_connections = parse_var("SQLQ_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = lookup("SQLQ_DEFAULT_QUERY_TIMEOUT_MS") {
            self.timeouts.default_query_timeout_ms =
                parse_var("SQLQ_DEFAULT_QUERY_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("SQLQ_LOCK_TIMEOUT_MS") {
            self.timeouts.lock_timeout_ms = parse_var("SQLQ_LOCK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("SQLQ_IDLE_IN_TX_SESSION_TIMEOUT_MS") {
            self.timeouts.idle_in_tx_session_timeout_ms =
                parse_var("SQLQ_IDLE_IN_TX_SESSION_TIMEOUT_MS", &value)?;
        }
        Ok(())
    }

    /// The validated timeout policy for these settings.
    pub fn timeout_policy(&self) -> Result<TimeoutPolicy, DbError> {
        TimeoutPolicy::try_from(self.timeouts)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
