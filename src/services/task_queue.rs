//! Durable task queue operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::task::SYSTEM_TASK_PREFIX;
use crate::domain::models::{
    NewTask, QueueConfig, RecurrenceRule, TaskFilter, TaskRecord, TaskStats, TaskStatus,
};
use crate::domain::ports::TaskRepository;
use crate::services::work_signal::WorkSignal;

/// Service for enqueueing, claiming and settling task rows.
///
/// The queue stores and hands out opaque payloads; retry policy belongs to
/// the worker that reports outcomes back through `finish_claimed` and
/// `reschedule_for_retry`.
pub struct TaskQueue {
    repo: Arc<dyn TaskRepository>,
    signal: WorkSignal,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(repo: Arc<dyn TaskRepository>, signal: WorkSignal, config: QueueConfig) -> Self {
        Self {
            repo,
            signal,
            config,
        }
    }

    /// The signal raised whenever due work is enqueued.
    pub const fn signal(&self) -> &WorkSignal {
        &self.signal
    }

    pub async fn enqueue(&self, task: NewTask) -> DomainResult<TaskRecord> {
        self.enqueue_at(task, Utc::now()).await
    }

    /// Enqueue `task` as of `now`.
    ///
    /// Singletons (explicit, or `system_`-prefixed ids in legacy mode) replace
    /// an existing row with the same id; everything else fails with
    /// `DuplicateTask` on a taken id.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, task_type = %task.task_type), err)]
    pub async fn enqueue_at(&self, mut task: NewTask, now: DateTime<Utc>) -> DomainResult<TaskRecord> {
        task.validate()?;
        if let Some(rule) = &task.recurrence_rule {
            RecurrenceRule::parse(rule)?;
        }
        task.max_retries.get_or_insert(self.config.default_max_retries);
        if task.original_task_id.is_none() {
            task.original_task_id = Some(task.task_id.clone());
        }

        let record = if self.is_singleton(&task) {
            self.repo.upsert(&task, now).await?
        } else {
            self.repo.insert(&task, now).await?
        };

        let due = task.scheduled_at.is_none_or(|at| at <= now);
        if due {
            self.signal.set();
        }

        info!(
            internal_id = record.internal_id,
            scheduled_at = ?record.scheduled_at,
            due,
            "Task enqueued"
        );
        Ok(record)
    }

    /// Enqueue with upsert semantics regardless of the task id.
    pub async fn register_singleton_task(&self, task: NewTask) -> DomainResult<TaskRecord> {
        self.enqueue(task.singleton()).await
    }

    fn is_singleton(&self, task: &NewTask) -> bool {
        task.singleton
            || (self.config.legacy_system_prefix_upsert && task.task_id.starts_with(SYSTEM_TASK_PREFIX))
    }

    pub async fn dequeue(&self, worker_id: &str, task_types: &[String]) -> DomainResult<Option<TaskRecord>> {
        self.dequeue_at(worker_id, task_types, Utc::now()).await
    }

    /// Claim the next due task of one of `task_types` for `worker_id`.
    #[instrument(skip(self, task_types), err)]
    pub async fn dequeue_at(
        &self,
        worker_id: &str,
        task_types: &[String],
        now: DateTime<Utc>,
    ) -> DomainResult<Option<TaskRecord>> {
        if task_types.is_empty() {
            return Ok(None);
        }
        let claimed = self.repo.claim_next(worker_id, task_types, now).await?;
        if let Some(task) = &claimed {
            debug!(task_id = %task.task_id, retry_count = task.retry_count, "Task claimed");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, error), err)]
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> DomainResult<bool> {
        let updated = self.repo.update_status(task_id, status, error).await?;
        if !updated {
            warn!(task_id, %status, "Status update matched no task");
        }
        Ok(updated)
    }

    /// Record the final status of a task claimed by `worker_id`.
    ///
    /// Returns false when the row was cancelled or reclaimed while the
    /// handler ran; the row is then left untouched.
    #[instrument(skip(self, error), err)]
    pub async fn finish_claimed(
        &self,
        task_id: &str,
        worker_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> DomainResult<bool> {
        let finished = self.repo.finish_claimed(task_id, worker_id, status, error).await?;
        if !finished {
            warn!(task_id, worker_id, %status, "Task no longer held by this worker, outcome dropped");
        }
        Ok(finished)
    }

    /// Return a claimed task to pending for another attempt at `next_scheduled_at`.
    #[instrument(skip(self, error), err)]
    pub async fn reschedule_for_retry(
        &self,
        task_id: &str,
        next_scheduled_at: DateTime<Utc>,
        new_retry_count: u32,
        error: &str,
    ) -> DomainResult<bool> {
        let rescheduled = self
            .repo
            .reschedule(task_id, next_scheduled_at, new_retry_count, error)
            .await?;
        if rescheduled {
            info!(task_id, %next_scheduled_at, new_retry_count, "Task rescheduled for retry");
        } else {
            warn!(task_id, "Retry reschedule matched no processing task");
        }
        Ok(rescheduled)
    }

    /// Give a failed task another attempt now, raising its retry budget.
    #[instrument(skip(self), err)]
    pub async fn manually_retry(&self, internal_id: i64) -> DomainResult<bool> {
        let retried = self.repo.manual_retry(internal_id, Utc::now()).await?;
        if retried {
            self.signal.set();
            info!(internal_id, "Task manually retried");
        } else {
            warn!(internal_id, "Manual retry matched no task");
        }
        Ok(retried)
    }

    pub async fn get_task(&self, task_id: &str) -> DomainResult<Option<TaskRecord>> {
        self.repo.get(task_id).await
    }

    pub async fn get_by_internal_id(&self, internal_id: i64) -> DomainResult<Option<TaskRecord>> {
        self.repo.get_by_internal_id(internal_id).await
    }

    pub async fn get_all(&self, filter: &TaskFilter) -> DomainResult<Vec<TaskRecord>> {
        self.repo.list(filter).await
    }

    /// Mark a pending or processing task failed. A handler already running
    /// for it is not interrupted, but its outcome is dropped.
    #[instrument(skip(self), err)]
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> DomainResult<bool> {
        let cancelled = self.repo.cancel(task_id, reason).await?;
        if cancelled {
            info!(task_id, "Task cancelled");
        }
        Ok(cancelled)
    }

    /// Cancel every pending occurrence of a recurring series.
    #[instrument(skip(self), err)]
    pub async fn cancel_series(&self, original_task_id: &str, reason: &str) -> DomainResult<u64> {
        let cancelled = self.repo.cancel_series(original_task_id, reason).await?;
        info!(original_task_id, cancelled, "Series cancelled");
        Ok(cancelled)
    }

    pub async fn count_by_status(&self) -> DomainResult<TaskStats> {
        self.repo.count_by_status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteTaskRepository};
    use crate::domain::errors::DomainError;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    async fn queue_with(config: QueueConfig) -> TaskQueue {
        let pool = create_migrated_test_pool().await.unwrap();
        TaskQueue::new(Arc::new(SqliteTaskRepository::new(pool)), WorkSignal::new(), config)
    }

    async fn queue() -> TaskQueue {
        queue_with(QueueConfig::default()).await
    }

    #[tokio::test]
    async fn test_enqueue_applies_defaults_and_raises_signal() {
        let queue = queue().await;
        let record = queue
            .enqueue_at(NewTask::new("t1", "llm_callback", json!({})), now())
            .await
            .unwrap();

        assert_eq!(record.max_retries, 3);
        assert_eq!(record.original_task_id.as_deref(), Some("t1"));
        assert!(queue.signal().is_set());
    }

    #[tokio::test]
    async fn test_future_task_does_not_raise_signal() {
        let queue = queue().await;
        queue
            .enqueue_at(
                NewTask::new("later", "llm_callback", json!({})).scheduled_at(now() + Duration::hours(1)),
                now(),
            )
            .await
            .unwrap();
        assert!(!queue.signal().is_set());
    }

    #[tokio::test]
    async fn test_malformed_rule_rejected_before_storage() {
        let queue = queue().await;
        let err = queue
            .enqueue_at(
                NewTask::new("bad", "llm_callback", json!({})).with_recurrence("FREQ=FORTNIGHTLY"),
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(queue.get_task("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_rejected_unless_singleton() {
        let queue = queue().await;
        queue.enqueue_at(NewTask::new("t1", "x", json!({})), now()).await.unwrap();

        let err = queue.enqueue_at(NewTask::new("t1", "x", json!({})), now()).await.unwrap_err();
        assert!(matches!(err, DomainError::DuplicateTask(_)));

        let replaced = queue
            .enqueue_at(NewTask::new("t1", "x", json!({ "v": 2 })).singleton(), now())
            .await
            .unwrap();
        assert_eq!(replaced.payload, json!({ "v": 2 }));
    }

    #[tokio::test]
    async fn test_system_prefix_upserts_only_in_legacy_mode() {
        let legacy = queue().await;
        legacy.enqueue_at(NewTask::new("system_x", "x", json!({})), now()).await.unwrap();
        assert!(legacy.enqueue_at(NewTask::new("system_x", "x", json!({})), now()).await.is_ok());

        let strict = queue_with(QueueConfig {
            legacy_system_prefix_upsert: false,
            ..QueueConfig::default()
        })
        .await;
        strict.enqueue_at(NewTask::new("system_x", "x", json!({})), now()).await.unwrap();
        let err = strict.enqueue_at(NewTask::new("system_x", "x", json!({})), now()).await.unwrap_err();
        assert!(matches!(err, DomainError::DuplicateTask(_)));
    }

    #[tokio::test]
    async fn test_update_status_on_missing_task_returns_false() {
        let queue = queue().await;
        assert!(!queue.update_status("ghost", TaskStatus::Completed, None).await.unwrap());
        assert!(!queue.reschedule_for_retry("ghost", now(), 1, "boom").await.unwrap());
    }

    #[tokio::test]
    async fn test_manual_retry_raises_signal() {
        let queue = queue().await;
        let record = queue.enqueue_at(NewTask::new("t1", "x", json!({})), now()).await.unwrap();
        queue.update_status("t1", TaskStatus::Failed, Some("boom")).await.unwrap();
        queue.signal().clear();

        assert!(queue.manually_retry(record.internal_id).await.unwrap());
        assert!(queue.signal().is_set());
        assert_eq!(queue.get_task("t1").await.unwrap().unwrap().status, TaskStatus::Pending);
    }
}
