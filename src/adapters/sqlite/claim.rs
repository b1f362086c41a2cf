//! Atomic claim strategies for `dequeue`.
//!
//! Both strategies pick the same row: pending, of a requested type, due, and
//! within its retry budget, ordered by retry count, then age, then insertion
//! order. They differ in how they make the pending -> processing transition
//! exclusive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::format_datetime;
use super::task_repository::{TaskRow, TASK_COLUMNS};
use crate::domain::errors::DomainResult;
use crate::domain::models::TaskRecord;

/// Claims at most one eligible task row for a worker.
#[async_trait]
pub trait AtomicClaim: Send + Sync {
    fn name(&self) -> &'static str;

    async fn claim(
        &self,
        pool: &SqlitePool,
        worker_id: &str,
        task_types: &[String],
        now: DateTime<Utc>,
    ) -> DomainResult<Option<TaskRecord>>;
}

/// Appends the eligibility predicate, ordering and `LIMIT 1` of the candidate query.
fn push_candidate_query<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    task_types: &'a [String],
    now: &str,
) {
    builder.push("SELECT internal_id FROM tasks WHERE status = 'pending' AND task_type IN (");
    let mut types = builder.separated(", ");
    for task_type in task_types {
        types.push_bind(task_type);
    }
    builder
        .push(") AND (scheduled_at IS NULL OR scheduled_at <= ")
        .push_bind(now.to_string())
        .push(") AND retry_count <= max_retries")
        .push(" ORDER BY retry_count ASC, created_at ASC, internal_id ASC LIMIT 1");
}

fn push_claim_update<'a>(builder: &mut QueryBuilder<'a, Sqlite>, worker_id: &'a str, now: &str) {
    builder
        .push("UPDATE tasks SET status = 'processing', locked_by = ")
        .push_bind(worker_id)
        .push(", locked_at = ")
        .push_bind(now.to_string());
}

/// Select and lock in one `UPDATE ... RETURNING` statement.
///
/// A write statement takes the database write lock before it evaluates its
/// subquery, so concurrent claimers are serialized and never see the same
/// candidate as pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteLockClaim;

#[async_trait]
impl AtomicClaim for WriteLockClaim {
    fn name(&self) -> &'static str {
        "write_lock"
    }

    async fn claim(
        &self,
        pool: &SqlitePool,
        worker_id: &str,
        task_types: &[String],
        now: DateTime<Utc>,
    ) -> DomainResult<Option<TaskRecord>> {
        if task_types.is_empty() {
            return Ok(None);
        }
        let now = format_datetime(&now);

        let mut builder = QueryBuilder::new("");
        push_claim_update(&mut builder, worker_id, &now);
        builder.push(" WHERE internal_id = (");
        push_candidate_query(&mut builder, task_types, &now);
        builder.push(") AND status = 'pending' RETURNING ").push(TASK_COLUMNS);

        let row: Option<TaskRow> = builder.build_query_as().fetch_optional(pool).await?;
        row.map(TryInto::try_into).transpose()
    }
}

/// Read a candidate, then claim it with a guarded update.
///
/// If another worker claims the candidate first the guarded update touches
/// no rows and this attempt yields `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticClaim;

#[async_trait]
impl AtomicClaim for OptimisticClaim {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    async fn claim(
        &self,
        pool: &SqlitePool,
        worker_id: &str,
        task_types: &[String],
        now: DateTime<Utc>,
    ) -> DomainResult<Option<TaskRecord>> {
        if task_types.is_empty() {
            return Ok(None);
        }
        let now = format_datetime(&now);

        let mut select = QueryBuilder::new("");
        push_candidate_query(&mut select, task_types, &now);
        let candidate: Option<(i64,)> = select.build_query_as().fetch_optional(pool).await?;
        let Some((internal_id,)) = candidate else {
            return Ok(None);
        };

        let mut update = QueryBuilder::new("");
        push_claim_update(&mut update, worker_id, &now);
        update
            .push(" WHERE internal_id = ")
            .push_bind(internal_id)
            .push(" AND status = 'pending' RETURNING ")
            .push(TASK_COLUMNS);

        let row: Option<TaskRow> = update.build_query_as().fetch_optional(pool).await?;
        if row.is_none() {
            debug!(internal_id, worker_id, "Lost claim race, candidate taken by another worker");
        }
        row.map(TryInto::try_into).transpose()
    }
}
