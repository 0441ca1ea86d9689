//! Worker configuration, read from `CUBE_*` environment variables.

use std::{str::FromStr, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Name the worker identifies itself with in logs.
    pub name: String,
    /// Address the API binds to.
    pub host: String,
    pub port: u16,
    /// How long the task loop sleeps once the queue is drained.
    pub poll_interval: Duration,
    /// Period of the host stats collector.
    pub stats_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            poll_interval: Duration::from_secs(5),
            stats_interval: Duration::from_secs(15),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            name: lookup("CUBE_WORKER_NAME").unwrap_or(defaults.name),
            host: lookup("CUBE_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "CUBE_PORT", defaults.port)?,
            poll_interval: parse_or(&lookup, "CUBE_POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())
                .map(Duration::from_secs)?,
            stats_interval: parse_or(&lookup, "CUBE_STATS_INTERVAL_SECS", defaults.stats_interval.as_secs())
                .map(Duration::from_secs)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}
