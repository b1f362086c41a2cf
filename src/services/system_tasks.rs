//! Built-in maintenance tasks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tracing::info;

use crate::domain::errors::DomainResult;
use crate::domain::models::{EventsConfig, NewTask, RecurrenceRule, TaskRecord};
use crate::domain::ports::EventRepository;
use crate::services::task_queue::TaskQueue;
use crate::services::task_worker::{HandlerRegistry, TaskHandler};

pub const EVENT_CLEANUP_TASK_ID: &str = "system_event_cleanup_daily";
pub const EVENT_CLEANUP_TASK_TYPE: &str = "system_event_cleanup";

/// Register (or refresh) the singleton event retention purge.
pub async fn register_system_tasks(
    queue: &TaskQueue,
    config: &EventsConfig,
    timezone: Tz,
    now: DateTime<Utc>,
) -> DomainResult<TaskRecord> {
    let rule = RecurrenceRule::parse(&config.cleanup_rule)?;
    let first_run = rule.next_occurrence(now, now, timezone).unwrap_or(now);

    let task = NewTask::new(
        EVENT_CLEANUP_TASK_ID,
        EVENT_CLEANUP_TASK_TYPE,
        json!({ "retention_hours": config.retention_hours }),
    )
    .scheduled_at(first_run)
    .with_max_retries(1)
    .with_recurrence(&config.cleanup_rule);

    let record = queue.register_singleton_task(task).await?;
    info!(task_id = EVENT_CLEANUP_TASK_ID, scheduled_at = %first_run, "System tasks registered");
    Ok(record)
}

/// Deletes received events older than the retention window.
pub struct EventCleanupHandler {
    events: Arc<dyn EventRepository>,
    default_retention_hours: u32,
}

impl EventCleanupHandler {
    pub fn new(events: Arc<dyn EventRepository>, default_retention_hours: u32) -> Self {
        Self {
            events,
            default_retention_hours,
        }
    }

    /// Register this handler for its task type.
    pub fn register(self, registry: &mut HandlerRegistry) {
        registry.register(EVENT_CLEANUP_TASK_TYPE, Arc::new(self));
    }
}

#[async_trait]
impl TaskHandler for EventCleanupHandler {
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()> {
        let hours = task
            .payload
            .get("retention_hours")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or_else(|| u64::from(self.default_retention_hours));
        let cutoff = Utc::now() - chrono::Duration::hours(i64::try_from(hours)?);

        let purged = self.events.purge_older_than(cutoff).await?;
        info!(purged, retention_hours = hours, "Purged old events");
        Ok(())
    }
}
