use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{NewTask, TaskFilter, TaskRecord, TaskStats, TaskStatus};

/// Repository port for task persistence operations
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new row. Fails with `DuplicateTask` if `task_id` is taken.
    async fn insert(&self, task: &NewTask, now: DateTime<Utc>) -> DomainResult<TaskRecord>;

    /// Insert or replace schedule, payload, retry budget and rule of an existing row.
    async fn upsert(&self, task: &NewTask, now: DateTime<Utc>) -> DomainResult<TaskRecord>;

    /// Atomically claim the next eligible row for `worker_id`.
    async fn claim_next(
        &self,
        worker_id: &str,
        task_types: &[String],
        now: DateTime<Utc>,
    ) -> DomainResult<Option<TaskRecord>>;

    /// Set the status (and optionally the error) of a row. False if no row matched.
    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> DomainResult<bool>;

    /// Move a row claimed by `worker_id` to a terminal status. False if the
    /// row is no longer processing under that worker.
    async fn finish_claimed(
        &self,
        task_id: &str,
        worker_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> DomainResult<bool>;

    /// Return a processing row to pending with a new schedule and retry count.
    async fn reschedule(
        &self,
        task_id: &str,
        next_scheduled_at: DateTime<Utc>,
        retry_count: u32,
        error: &str,
    ) -> DomainResult<bool>;

    /// Re-arm a failed row for another attempt.
    async fn manual_retry(&self, internal_id: i64, now: DateTime<Utc>) -> DomainResult<bool>;

    /// Get a row by its logical id.
    async fn get(&self, task_id: &str) -> DomainResult<Option<TaskRecord>>;

    /// Get a row by its surrogate key.
    async fn get_by_internal_id(&self, internal_id: i64) -> DomainResult<Option<TaskRecord>>;

    /// List rows, newest first.
    async fn list(&self, filter: &TaskFilter) -> DomainResult<Vec<TaskRecord>>;

    /// Mark a pending or processing row failed with a cancellation reason.
    async fn cancel(&self, task_id: &str, reason: &str) -> DomainResult<bool>;

    /// Cancel every pending row of a series. Returns the number cancelled.
    async fn cancel_series(&self, original_task_id: &str, reason: &str) -> DomainResult<u64>;

    /// Row counts per status.
    async fn count_by_status(&self) -> DomainResult<TaskStats>;
}
