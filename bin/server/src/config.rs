//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables.

use serde::Deserialize;

/// Server configuration for the run submission and monitoring API.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL backing the run/workflow repository.
    pub database_url: String,

    /// NATS server URL backing the run cache and live event broadcast.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// HTTP listen address, e.g. "0.0.0.0:3000".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

/// Scheduler admission-loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of runs executing concurrently.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Interval between admission-loop polls, in seconds.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

fn default_max_concurrent_runs() -> usize {
    10
}

fn default_poll_interval_seconds() -> u64 {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_has_correct_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent_runs, 10);
        assert_eq!(config.poll_interval_seconds, 2);
    }
}
