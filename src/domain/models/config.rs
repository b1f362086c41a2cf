use serde::{Deserialize, Serialize};

/// Main configuration structure for Conduit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Task queue behaviour
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker loop tuning
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Event processing and listener limits
    #[serde(default)]
    pub events: EventsConfig,

    /// IANA timezone used for recurrence and daily rate-limit resets
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            events: EventsConfig::default(),
            timezone: default_timezone(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".conduit/conduit.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// File rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// How `dequeue` claims a row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStrategyKind {
    /// Single `UPDATE ... RETURNING` under the database write lock.
    #[default]
    WriteLock,
    /// Select a candidate, then a guarded update; losing a race yields nothing.
    Optimistic,
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    #[serde(default)]
    pub claim_strategy: ClaimStrategyKind,

    /// Retry budget for tasks enqueued without an explicit one
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Treat `system_`-prefixed task ids as singletons
    #[serde(default = "default_true")]
    pub legacy_system_prefix_upsert: bool,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_strategy: ClaimStrategyKind::default(),
            default_max_retries: default_max_retries(),
            legacy_system_prefix_upsert: true,
        }
    }
}

/// Worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Identifier recorded in `locked_by`; generated when unset
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Upper bound on idle sleep between polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Initial retry backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    10_000
}

const fn default_max_backoff_ms() -> u64 {
    300_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval_secs: default_poll_interval_secs(),
            retry_initial_backoff_ms: default_initial_backoff_ms(),
            retry_max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Event processing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EventsConfig {
    /// How often the processor reloads its listener cache
    #[serde(default = "default_cache_refresh_secs")]
    pub listener_cache_refresh_secs: u64,

    /// Per-listener cap on executions per local day
    #[serde(default = "default_max_daily_executions")]
    pub max_daily_executions: u32,

    /// How long received events are kept
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,

    /// Schedule of the event retention purge
    #[serde(default = "default_cleanup_rule")]
    pub cleanup_rule: String,
}

const fn default_cache_refresh_secs() -> u64 {
    60
}

const fn default_max_daily_executions() -> u32 {
    5
}

const fn default_retention_hours() -> u32 {
    48
}

fn default_cleanup_rule() -> String {
    "FREQ=DAILY;BYHOUR=3;BYMINUTE=0".to_string()
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            listener_cache_refresh_secs: default_cache_refresh_secs(),
            max_daily_executions: default_max_daily_executions(),
            retention_hours: default_retention_hours(),
            cleanup_rule: default_cleanup_rule(),
        }
    }
}
