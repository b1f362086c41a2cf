//! SQLite implementation of the EventRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::{format_datetime, parse_datetime, parse_json_or_default};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::StoredEvent;
use crate::domain::ports::EventRepository;

const EVENT_COLUMNS: &str = "event_id, source_id, event_data, triggered_listener_ids, timestamp";

#[derive(Clone)]
pub struct SqliteEventRepository {
    pool: SqlitePool,
}

impl SqliteEventRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn record(&self, event: &StoredEvent) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO recent_events (event_id, source_id, event_data, triggered_listener_ids, timestamp) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(&event.source_id)
        .bind(serde_json::to_string(&event.event_data)?)
        .bind(serde_json::to_string(&event.triggered_listener_ids)?)
        .bind(format_datetime(&event.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> DomainResult<Option<StoredEvent>> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM recent_events WHERE event_id = ?"))
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_recent(
        &self,
        source_id: Option<&str>,
        limit: u32,
    ) -> DomainResult<Vec<StoredEvent>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM recent_events"));
        if let Some(source_id) = source_id {
            builder.push(" WHERE source_id = ").push_bind(source_id);
        }
        builder
            .push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows: Vec<EventRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query("DELETE FROM recent_events WHERE timestamp < ?")
            .bind(format_datetime(&cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: String,
    source_id: String,
    event_data: String,
    triggered_listener_ids: Option<String>,
    timestamp: String,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = DomainError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(StoredEvent {
            event_id: row.event_id,
            source_id: row.source_id,
            event_data: serde_json::from_str(&row.event_data)?,
            triggered_listener_ids: parse_json_or_default(row.triggered_listener_ids)?,
            timestamp: parse_datetime(&row.timestamp)?,
        })
    }
}
