use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;
use crate::domain::models::{parse_timezone, RecurrenceRule};

/// Project-local directory holding config files and the default database.
pub const CONFIG_DIR: &str = ".conduit";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid poll_interval_secs: {0}. Must be at least 1")]
    InvalidPollInterval(u64),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid max_daily_executions: {0}. Must be at least 1")]
    InvalidMaxDailyExecutions(u32),

    #[error("Invalid listener_cache_refresh_secs: {0}. Must be at least 1")]
    InvalidCacheRefresh(u64),

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid cleanup_rule '{rule}': {reason}")]
    InvalidCleanupRule { rule: String, reason: String },
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .conduit/config.yaml (project config, created by init)
    /// 3. .conduit/local.yaml (project local overrides, optional)
    /// 4. Environment variables (CONDUIT_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(CONFIG_DIR)
    }

    /// Same as [`ConfigLoader::load`] with the config directory at `dir`.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Config> {
        let dir = dir.as_ref();
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed("CONDUIT_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        if config.worker.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidPollInterval(0));
        }
        if config.worker.retry_initial_backoff_ms >= config.worker.retry_max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.worker.retry_initial_backoff_ms,
                config.worker.retry_max_backoff_ms,
            ));
        }

        if config.events.max_daily_executions == 0 {
            return Err(ConfigError::InvalidMaxDailyExecutions(0));
        }
        if config.events.listener_cache_refresh_secs == 0 {
            return Err(ConfigError::InvalidCacheRefresh(0));
        }
        if let Err(e) = RecurrenceRule::parse(&config.events.cleanup_rule) {
            return Err(ConfigError::InvalidCleanupRule {
                rule: config.events.cleanup_rule.clone(),
                reason: e.to_string(),
            });
        }

        if parse_timezone(&config.timezone).is_err() {
            return Err(ConfigError::InvalidTimezone(config.timezone.clone()));
        }

        Ok(())
    }
}
