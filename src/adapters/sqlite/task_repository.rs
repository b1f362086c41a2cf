//! SQLite implementation of the TaskRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;

use super::claim::{AtomicClaim, OptimisticClaim, WriteLockClaim};
use super::{format_datetime, format_optional_datetime, parse_datetime, parse_optional_datetime, to_u32};
use crate::domain::errors::{is_unique_violation, DomainError, DomainResult};
use crate::domain::models::{
    ClaimStrategyKind, NewTask, TaskFilter, TaskRecord, TaskStats, TaskStatus,
};
use crate::domain::ports::TaskRepository;

/// Column list shared by every query that materializes a `TaskRow`.
pub(crate) const TASK_COLUMNS: &str = "internal_id, task_id, task_type, payload, status, \
    scheduled_at, retry_count, max_retries, recurrence_rule, original_task_id, \
    locked_by, locked_at, last_error, created_at, occurrence_at";

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
    claim: Arc<dyn AtomicClaim>,
}

impl SqliteTaskRepository {
    /// Repository claiming with the default write-lock strategy.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_claim(pool, Arc::new(WriteLockClaim))
    }

    pub fn with_claim_strategy(pool: SqlitePool, kind: ClaimStrategyKind) -> Self {
        let claim: Arc<dyn AtomicClaim> = match kind {
            ClaimStrategyKind::WriteLock => Arc::new(WriteLockClaim),
            ClaimStrategyKind::Optimistic => Arc::new(OptimisticClaim),
        };
        Self::with_claim(pool, claim)
    }

    pub fn with_claim(pool: SqlitePool, claim: Arc<dyn AtomicClaim>) -> Self {
        Self { pool, claim }
    }

    pub fn claim_strategy(&self) -> &'static str {
        self.claim.name()
    }

    fn insert_builder<'a>(task: &'a NewTask, now: DateTime<Utc>) -> DomainResult<QueryBuilder<'a, Sqlite>> {
        let payload = serde_json::to_string(&task.payload)?;
        let original_task_id = task.original_task_id.as_deref().unwrap_or(&task.task_id);

        let mut builder = QueryBuilder::new(
            "INSERT INTO tasks (task_id, task_type, payload, status, scheduled_at, retry_count, \
             max_retries, recurrence_rule, original_task_id, created_at, occurrence_at) VALUES (",
        );
        let mut values = builder.separated(", ");
        values.push_bind(&task.task_id);
        values.push_bind(&task.task_type);
        values.push_bind(payload);
        values.push_bind(TaskStatus::Pending.as_str());
        values.push_bind(format_optional_datetime(task.scheduled_at.as_ref()));
        values.push_bind(0_i64);
        values.push_bind(i64::from(task.max_retries.unwrap_or_default()));
        values.push_bind(&task.recurrence_rule);
        values.push_bind(original_task_id);
        values.push_bind(format_datetime(&now));
        values.push_bind(format_optional_datetime(task.scheduled_at.as_ref()));
        builder.push(")");
        Ok(builder)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn insert(&self, task: &NewTask, now: DateTime<Utc>) -> DomainResult<TaskRecord> {
        let mut builder = Self::insert_builder(task, now)?;
        builder.push(" RETURNING ").push(TASK_COLUMNS);

        let row: TaskRow = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DomainError::DuplicateTask(task.task_id.clone())
                } else {
                    e.into()
                }
            })?;
        row.try_into()
    }

    async fn upsert(&self, task: &NewTask, now: DateTime<Utc>) -> DomainResult<TaskRecord> {
        let mut builder = Self::insert_builder(task, now)?;
        builder
            .push(
                " ON CONFLICT (task_id) DO UPDATE SET \
                 scheduled_at = excluded.scheduled_at, \
                 occurrence_at = excluded.occurrence_at, \
                 payload = excluded.payload, \
                 max_retries = excluded.max_retries, \
                 recurrence_rule = excluded.recurrence_rule \
                 RETURNING ",
            )
            .push(TASK_COLUMNS);

        let row: TaskRow = builder.build_query_as().fetch_one(&self.pool).await?;
        row.try_into()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        task_types: &[String],
        now: DateTime<Utc>,
    ) -> DomainResult<Option<TaskRecord>> {
        if task_types.is_empty() {
            return Ok(None);
        }
        self.claim.claim(&self.pool, worker_id, task_types, now).await
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, last_error = COALESCE(?2, last_error), \
             locked_by = CASE WHEN ?1 = 'processing' THEN locked_by END, \
             locked_at = CASE WHEN ?1 = 'processing' THEN locked_at END \
             WHERE task_id = ?3",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_claimed(
        &self,
        task_id: &str,
        worker_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, last_error = COALESCE(?, last_error), \
             locked_by = NULL, locked_at = NULL \
             WHERE task_id = ? AND status = 'processing' AND locked_by = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reschedule(
        &self,
        task_id: &str,
        next_scheduled_at: DateTime<Utc>,
        retry_count: u32,
        error: &str,
    ) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', scheduled_at = ?, retry_count = ?, \
             last_error = ?, locked_by = NULL, locked_at = NULL \
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(format_datetime(&next_scheduled_at))
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn manual_retry(&self, internal_id: i64, now: DateTime<Utc>) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', \
             max_retries = MAX(max_retries, retry_count) + 1, \
             last_error = NULL, scheduled_at = ?, locked_by = NULL, locked_at = NULL \
             WHERE internal_id = ?",
        )
        .bind(format_datetime(&now))
        .bind(internal_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, task_id: &str) -> DomainResult<Option<TaskRecord>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_internal_id(&self, internal_id: i64) -> DomainResult<Option<TaskRecord>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE internal_id = ?"))
                .bind(internal_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, filter: &TaskFilter) -> DomainResult<Vec<TaskRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(task_type) = &filter.task_type {
            builder.push(" AND task_type = ").push_bind(task_type);
        }
        if let Some(series) = &filter.original_task_id {
            builder.push(" AND original_task_id = ").push_bind(series);
        }
        builder.push(" ORDER BY created_at DESC, internal_id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows: Vec<TaskRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn cancel(&self, task_id: &str, reason: &str) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', last_error = ?, locked_by = NULL, locked_at = NULL \
             WHERE task_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(format!("Cancelled: {reason}"))
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_series(&self, original_task_id: &str, reason: &str) -> DomainResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'failed', last_error = ? \
             WHERE original_task_id = ? AND status = 'pending'",
        )
        .bind(format!("Cancelled: {reason}"))
        .bind(original_task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> DomainResult<TaskStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = TaskStats::default();
        for (status, count) in rows {
            if let Some(status) = TaskStatus::from_str(&status) {
                stats.record(status, count.max(0) as u64);
            }
        }
        Ok(stats)
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TaskRow {
    internal_id: i64,
    task_id: String,
    task_type: String,
    payload: String,
    status: String,
    scheduled_at: Option<String>,
    retry_count: i64,
    max_retries: i64,
    recurrence_rule: Option<String>,
    original_task_id: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    occurrence_at: Option<String>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid status: {}", row.status))
        })?;
        let payload = serde_json::from_str(&row.payload)?;

        Ok(TaskRecord {
            internal_id: row.internal_id,
            task_id: row.task_id,
            task_type: row.task_type,
            payload,
            status,
            scheduled_at: parse_optional_datetime(row.scheduled_at)?,
            retry_count: to_u32(row.retry_count),
            max_retries: to_u32(row.max_retries),
            recurrence_rule: row.recurrence_rule,
            original_task_id: row.original_task_id,
            locked_by: row.locked_by,
            locked_at: parse_optional_datetime(row.locked_at)?,
            last_error: row.last_error,
            created_at: parse_datetime(&row.created_at)?,
            occurrence_at: parse_optional_datetime(row.occurrence_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    async fn setup() -> SqliteTaskRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteTaskRepository::new(pool)
    }

    fn new_task(id: &str) -> NewTask {
        NewTask::new(id, "llm_callback", json!({ "n": 1 })).with_max_retries(3)
    }

    #[tokio::test]
    async fn test_insert_defaults_series_to_own_id() {
        let repo = setup().await;
        let record = repo.insert(&new_task("t1"), now()).await.unwrap();

        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.original_task_id.as_deref(), Some("t1"));
        assert_eq!(record.payload, json!({ "n": 1 }));
        assert_eq!(record.created_at, now());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let repo = setup().await;
        repo.insert(&new_task("t1"), now()).await.unwrap();
        let err = repo.insert(&new_task("t1"), now()).await.unwrap_err();
        assert!(matches!(err, DomainError::DuplicateTask(id) if id == "t1"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_schedule_and_payload() {
        let repo = setup().await;
        let first = repo.insert(&new_task("system_x"), now()).await.unwrap();

        let later = now() + Duration::hours(2);
        let replacement = NewTask::new("system_x", "llm_callback", json!({ "n": 2 }))
            .scheduled_at(later)
            .with_max_retries(5)
            .with_recurrence("FREQ=DAILY");
        let second = repo.upsert(&replacement, now()).await.unwrap();

        assert_eq!(second.internal_id, first.internal_id);
        assert_eq!(second.scheduled_at, Some(later));
        assert_eq!(second.payload, json!({ "n": 2 }));
        assert_eq!(second.max_retries, 5);
        assert_eq!(second.recurrence_rule.as_deref(), Some("FREQ=DAILY"));
        assert_eq!(repo.count_by_status().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_requires_processing() {
        let repo = setup().await;
        repo.insert(&new_task("t1"), now()).await.unwrap();
        let next = now() + Duration::seconds(30);

        assert!(!repo.reschedule("t1", next, 1, "boom").await.unwrap());

        repo.claim_next("w1", &["llm_callback".to_string()], now()).await.unwrap().unwrap();
        assert!(repo.reschedule("t1", next, 1, "boom").await.unwrap());

        let task = repo.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.scheduled_at, Some(next));
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert!(task.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_finish_claimed_leaves_cancelled_row_alone() {
        let repo = setup().await;
        let types = ["llm_callback".to_string()];
        repo.insert(&new_task("t1"), now()).await.unwrap();
        repo.insert(&new_task("t2"), now()).await.unwrap();

        repo.claim_next("w1", &types, now()).await.unwrap().unwrap();
        assert!(repo.cancel("t1", "operator stop").await.unwrap());
        assert!(!repo.finish_claimed("t1", "w1", TaskStatus::Completed, None).await.unwrap());

        let cancelled = repo.get("t1").await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);
        assert_eq!(cancelled.last_error.as_deref(), Some("Cancelled: operator stop"));

        repo.claim_next("w1", &types, now()).await.unwrap().unwrap();
        assert!(!repo.finish_claimed("t2", "w2", TaskStatus::Completed, None).await.unwrap());
        assert!(repo.finish_claimed("t2", "w1", TaskStatus::Completed, None).await.unwrap());
        let done = repo.get("t2").await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_retry_keeps_occurrence_slot() {
        let repo = setup().await;
        let slot = now() + Duration::hours(1);
        repo.insert(&new_task("t1").scheduled_at(slot), now()).await.unwrap();

        repo.claim_next("w1", &["llm_callback".to_string()], slot).await.unwrap().unwrap();
        let retry_at = slot + Duration::minutes(5);
        repo.reschedule("t1", retry_at, 1, "boom").await.unwrap();
        repo.manual_retry(repo.get("t1").await.unwrap().unwrap().internal_id, retry_at)
            .await
            .unwrap();

        let task = repo.get("t1").await.unwrap().unwrap();
        assert_eq!(task.scheduled_at, Some(retry_at));
        assert_eq!(task.occurrence_at, Some(slot));
    }

    #[tokio::test]
    async fn test_manual_retry_raises_budget() {
        let repo = setup().await;
        let record = repo.insert(&new_task("t1").with_max_retries(1), now()).await.unwrap();
        repo.claim_next("w1", &["llm_callback".to_string()], now()).await.unwrap();
        repo.reschedule("t1", now(), 2, "boom").await.unwrap();
        repo.update_status("t1", TaskStatus::Failed, Some("exhausted")).await.unwrap();

        let later = now() + Duration::minutes(5);
        assert!(repo.manual_retry(record.internal_id, later).await.unwrap());

        let task = repo.get_by_internal_id(record.internal_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 3);
        assert!(task.last_error.is_none());
        assert_eq!(task.scheduled_at, Some(later));
        assert!(task.has_retry_budget());
        assert!(!repo.manual_retry(9999, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_series_only_touches_pending() {
        let repo = setup().await;
        repo.insert(&new_task("s"), now()).await.unwrap();
        repo.insert(&new_task("s_recur_1").in_series("s"), now()).await.unwrap();
        repo.insert(&new_task("s_recur_2").in_series("s"), now()).await.unwrap();
        repo.update_status("s", TaskStatus::Completed, None).await.unwrap();

        assert_eq!(repo.cancel_series("s", "user request").await.unwrap(), 2);

        let failed = repo
            .list(&TaskFilter { status: Some(TaskStatus::Failed), ..TaskFilter::default() })
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|t| t.last_error.as_deref() == Some("Cancelled: user request")));
        assert_eq!(repo.get("s").await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_newest_first() {
        let repo = setup().await;
        repo.insert(&new_task("a"), now()).await.unwrap();
        repo.insert(&new_task("b"), now() + Duration::seconds(1)).await.unwrap();
        repo.insert(&NewTask::new("c", "script_execution", json!({})), now()).await.unwrap();

        let callbacks = repo
            .list(&TaskFilter { task_type: Some("llm_callback".into()), ..TaskFilter::default() })
            .await
            .unwrap();
        let ids: Vec<_> = callbacks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let limited = repo.list(&TaskFilter { limit: Some(1), ..TaskFilter::default() }).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
