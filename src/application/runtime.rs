//! Builds the queue, listener and event services from one [`Config`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::adapters::sqlite::{
    database_url, initialize_database, PoolConfig, SqliteEventRepository,
    SqliteListenerRepository, SqliteTaskRepository,
};
use crate::domain::models::{parse_timezone, Config, TaskRecord};
use crate::domain::ports::{EventRepository, ListenerRepository};
use crate::services::{
    register_system_tasks, EventCleanupHandler, EventProcessor, HandlerRegistry, ListenerService,
    RateLimiter, RetryPolicy, TaskQueue, TaskWorker, WorkSignal,
};

/// Fully wired services sharing one pool, one work signal and one timezone.
pub struct Conduit {
    config: Config,
    timezone: Tz,
    pool: SqlitePool,
    queue: Arc<TaskQueue>,
    listeners: Arc<ListenerService>,
    events: Arc<dyn EventRepository>,
    processor: Arc<EventProcessor>,
}

impl Conduit {
    /// Open (creating and migrating if needed) the configured database.
    pub async fn open(config: Config) -> Result<Self> {
        let url = database_url(&config.database.path);
        let pool = initialize_database(&url, Some(PoolConfig::from(&config.database)))
            .await
            .with_context(|| format!("Failed to open database at {}", config.database.path))?;
        Self::from_pool(config, pool)
    }

    /// Wire services over an already migrated pool.
    pub fn from_pool(config: Config, pool: SqlitePool) -> Result<Self> {
        let timezone = parse_timezone(&config.timezone)
            .with_context(|| format!("Invalid timezone '{}'", config.timezone))?;

        let task_repo = Arc::new(SqliteTaskRepository::with_claim_strategy(
            pool.clone(),
            config.queue.claim_strategy,
        ));
        let listener_repo: Arc<dyn ListenerRepository> =
            Arc::new(SqliteListenerRepository::new(pool.clone()));
        let events: Arc<dyn EventRepository> = Arc::new(SqliteEventRepository::new(pool.clone()));

        let queue = Arc::new(TaskQueue::new(task_repo, WorkSignal::new(), config.queue.clone()));
        let rate_limiter = || {
            RateLimiter::new(
                listener_repo.clone(),
                config.events.max_daily_executions,
                timezone,
            )
        };
        let listeners = Arc::new(ListenerService::new(listener_repo.clone(), rate_limiter()));
        let processor = Arc::new(EventProcessor::new(
            listener_repo.clone(),
            events.clone(),
            queue.clone(),
            rate_limiter(),
        ));

        Ok(Self {
            config,
            timezone,
            pool,
            queue,
            listeners,
            events,
            processor,
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    pub fn listeners(&self) -> Arc<ListenerService> {
        self.listeners.clone()
    }

    pub fn events(&self) -> Arc<dyn EventRepository> {
        self.events.clone()
    }

    pub fn processor(&self) -> Arc<EventProcessor> {
        self.processor.clone()
    }

    /// Register the built-in recurring maintenance tasks.
    pub async fn register_system_tasks(&self) -> Result<TaskRecord> {
        register_system_tasks(&self.queue, &self.config.events, self.timezone, Utc::now())
            .await
            .context("Failed to register system tasks")
    }

    /// Registry preloaded with the built-in system task handlers.
    pub fn system_registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        EventCleanupHandler::new(self.events.clone(), self.config.events.retention_hours)
            .register(&mut registry);
        registry
    }

    /// Build a worker over this runtime's queue.
    ///
    /// Without an explicit id the configured `worker.worker_id` is used,
    /// falling back to a random one.
    pub fn worker(&self, worker_id: Option<String>, registry: HandlerRegistry) -> TaskWorker {
        let worker_id = worker_id
            .or_else(|| self.config.worker.worker_id.clone())
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));

        TaskWorker::new(
            worker_id,
            self.queue.clone(),
            registry,
            RetryPolicy::from(&self.config.worker),
            Duration::from_secs(self.config.worker.poll_interval_secs),
            self.timezone,
        )
    }

    /// Keep the listener cache within `events.listener_cache_refresh_secs`
    /// of storage until `shutdown` fires.
    pub fn spawn_cache_refresher(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.events.listener_cache_refresh_secs);
        info!(interval_secs = interval.as_secs(), "Starting listener cache refresher");
        self.processor.spawn_cache_refresher(interval, shutdown)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
