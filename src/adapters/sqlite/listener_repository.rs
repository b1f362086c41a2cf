//! SQLite implementation of the ListenerRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::{format_datetime, parse_datetime, parse_json_or_default, parse_optional_datetime, to_u32};
use crate::domain::errors::{is_unique_violation, DomainError, DomainResult};
use crate::domain::models::{
    EventListener, ExecutionCount, ListenerAction, ListenerFilter, ListenerUpdate,
    NewEventListener,
};
use crate::domain::ports::ListenerRepository;

const LISTENER_COLUMNS: &str = "id, name, description, source_id, match_conditions, action_type, \
    action_config, conversation_id, interface_type, enabled, one_time, daily_executions, \
    daily_reset_at, last_execution_at, created_at";

#[derive(Clone)]
pub struct SqliteListenerRepository {
    pool: SqlitePool,
}

impl SqliteListenerRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(&self, clause: &str, id: i64) -> DomainResult<Option<EventListener>> {
        let row: Option<ListenerRow> =
            sqlx::query_as(&format!("SELECT {LISTENER_COLUMNS} FROM event_listeners WHERE {clause}"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }
}

fn action_config_json(action: &ListenerAction) -> DomainResult<(&'static str, Option<String>)> {
    let (action_type, config) = action.to_columns();
    let config = config.map(|c| serde_json::to_string(&c)).transpose()?;
    Ok((action_type, config))
}

#[async_trait]
impl ListenerRepository for SqliteListenerRepository {
    async fn create(
        &self,
        listener: &NewEventListener,
        now: DateTime<Utc>,
    ) -> DomainResult<EventListener> {
        let conditions = serde_json::to_string(&listener.match_conditions)?;
        let (action_type, action_config) = action_config_json(&listener.action)?;

        let row: ListenerRow = sqlx::query_as(&format!(
            "INSERT INTO event_listeners (name, description, source_id, match_conditions, \
             action_type, action_config, conversation_id, interface_type, enabled, one_time, \
             daily_executions, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?) \
             RETURNING {LISTENER_COLUMNS}"
        ))
        .bind(&listener.name)
        .bind(&listener.description)
        .bind(&listener.source_id)
        .bind(conditions)
        .bind(action_type)
        .bind(action_config)
        .bind(&listener.conversation_id)
        .bind(&listener.interface_type)
        .bind(listener.enabled)
        .bind(listener.one_time)
        .bind(format_datetime(&now))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DomainError::DuplicateListener {
                    name: listener.name.clone(),
                    conversation_id: listener.conversation_id.clone(),
                }
            } else {
                e.into()
            }
        })?;

        row.try_into()
    }

    async fn get(&self, id: i64) -> DomainResult<Option<EventListener>> {
        self.fetch_one_where("id = ?", id).await
    }

    async fn get_by_name(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> DomainResult<Option<EventListener>> {
        let row: Option<ListenerRow> = sqlx::query_as(&format!(
            "SELECT {LISTENER_COLUMNS} FROM event_listeners WHERE conversation_id = ? AND name = ?"
        ))
        .bind(conversation_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, filter: &ListenerFilter) -> DomainResult<Vec<EventListener>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {LISTENER_COLUMNS} FROM event_listeners WHERE 1 = 1"));
        if let Some(conversation_id) = &filter.conversation_id {
            builder.push(" AND conversation_id = ").push_bind(conversation_id);
        }
        if let Some(source_id) = &filter.source_id {
            builder.push(" AND source_id = ").push_bind(source_id);
        }
        if filter.enabled_only {
            builder.push(" AND enabled = 1");
        }
        builder.push(" ORDER BY id ASC");

        let rows: Vec<ListenerRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_enabled(&self) -> DomainResult<Vec<EventListener>> {
        self.list(&ListenerFilter {
            enabled_only: true,
            ..ListenerFilter::default()
        })
        .await
    }

    async fn update(&self, id: i64, update: &ListenerUpdate) -> DomainResult<EventListener> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE event_listeners SET id = id");
        if let Some(description) = &update.description {
            builder.push(", description = ").push_bind(description);
        }
        if let Some(conditions) = &update.match_conditions {
            builder
                .push(", match_conditions = ")
                .push_bind(serde_json::to_string(conditions)?);
        }
        if let Some(action) = &update.action {
            let (action_type, action_config) = action_config_json(action)?;
            builder
                .push(", action_type = ")
                .push_bind(action_type)
                .push(", action_config = ")
                .push_bind(action_config);
        }
        if let Some(one_time) = update.one_time {
            builder.push(", one_time = ").push_bind(one_time);
        }
        if let Some(enabled) = update.enabled {
            builder.push(", enabled = ").push_bind(enabled);
        }
        builder
            .push(" WHERE id = ")
            .push_bind(id)
            .push(" RETURNING ")
            .push(LISTENER_COLUMNS);

        let row: Option<ListenerRow> = builder.build_query_as().fetch_optional(&self.pool).await?;
        row.ok_or(DomainError::ListenerNotFound(id))?.try_into()
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> DomainResult<bool> {
        let result = sqlx::query("UPDATE event_listeners SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: i64) -> DomainResult<bool> {
        let result = sqlx::query("DELETE FROM event_listeners WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_execution(
        &self,
        id: i64,
        conversation_id: &str,
        cap: u32,
        now: DateTime<Utc>,
        next_reset_at: DateTime<Utc>,
    ) -> DomainResult<ExecutionCount> {
        let now_str = format_datetime(&now);

        if cap > 0 {
            // New local day: start counting again from this execution.
            let reset = sqlx::query(
                "UPDATE event_listeners SET daily_executions = 1, daily_reset_at = ?, \
                 last_execution_at = ? \
                 WHERE id = ? AND conversation_id = ? \
                 AND (daily_reset_at IS NULL OR daily_reset_at < ?)",
            )
            .bind(format_datetime(&next_reset_at))
            .bind(&now_str)
            .bind(id)
            .bind(conversation_id)
            .bind(&now_str)
            .execute(&self.pool)
            .await?;
            if reset.rows_affected() > 0 {
                return Ok(ExecutionCount::Reset);
            }

            let incremented: Option<(i64,)> = sqlx::query_as(
                "UPDATE event_listeners SET daily_executions = daily_executions + 1, \
                 last_execution_at = ? \
                 WHERE id = ? AND conversation_id = ? AND daily_executions < ? \
                 RETURNING daily_executions",
            )
            .bind(&now_str)
            .bind(id)
            .bind(conversation_id)
            .bind(i64::from(cap))
            .fetch_optional(&self.pool)
            .await?;
            if let Some((executions,)) = incremented {
                return Ok(ExecutionCount::Incremented(to_u32(executions)));
            }
        }

        let current: Option<(i64, Option<String>)> = sqlx::query_as(
            "SELECT daily_executions, daily_reset_at FROM event_listeners \
             WHERE id = ? AND conversation_id = ?",
        )
        .bind(id)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            None => Ok(ExecutionCount::NotFound),
            Some((executions, reset_at)) => Ok(ExecutionCount::LimitReached {
                executions: to_u32(executions),
                resets_at: parse_optional_datetime(reset_at)?,
            }),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ListenerRow {
    id: i64,
    name: String,
    description: Option<String>,
    source_id: String,
    match_conditions: String,
    action_type: String,
    action_config: Option<String>,
    conversation_id: String,
    interface_type: String,
    enabled: bool,
    one_time: bool,
    daily_executions: i64,
    daily_reset_at: Option<String>,
    last_execution_at: Option<String>,
    created_at: String,
}

impl TryFrom<ListenerRow> for EventListener {
    type Error = DomainError;

    fn try_from(row: ListenerRow) -> Result<Self, Self::Error> {
        let match_conditions: Map<String, Value> = parse_json_or_default(Some(row.match_conditions))?;
        let action_config: Option<Value> = row
            .action_config
            .filter(|c| !c.is_empty())
            .map(|c| serde_json::from_str(&c))
            .transpose()?;

        Ok(EventListener {
            id: row.id,
            name: row.name,
            description: row.description,
            source_id: row.source_id,
            match_conditions,
            action: ListenerAction::from_columns(&row.action_type, action_config)?,
            conversation_id: row.conversation_id,
            interface_type: row.interface_type,
            enabled: row.enabled,
            one_time: row.one_time,
            daily_executions: to_u32(row.daily_executions),
            daily_reset_at: parse_optional_datetime(row.daily_reset_at)?,
            last_execution_at: parse_optional_datetime(row.last_execution_at)?,
            created_at: parse_datetime(&row.created_at)?,
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

    async fn setup() -> SqliteListenerRepository {
        SqliteListenerRepository::new(create_migrated_test_pool().await.unwrap())
    }

    fn motion(name: &str, conversation: &str) -> NewEventListener {
        NewEventListener::new(
            name,
            "home_assistant",
            ListenerAction::WakeLlm { context: Some("check the camera".into()) },
            conversation,
            "telegram",
        )
        .with_condition("entity_id", json!("binary_sensor.motion"))
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let repo = setup().await;
        let created = repo.create(&motion("motion", "c1"), now()).await.unwrap();

        assert!(created.enabled);
        assert_eq!(created.daily_executions, 0);
        assert_eq!(created.match_conditions["entity_id"], json!("binary_sensor.motion"));
        assert_eq!(
            created.action,
            ListenerAction::WakeLlm { context: Some("check the camera".into()) }
        );

        let by_name = repo.get_by_name("c1", "motion").await.unwrap().unwrap();
        assert_eq!(by_name, created);
    }

    #[tokio::test]
    async fn test_names_are_unique_per_conversation() {
        let repo = setup().await;
        repo.create(&motion("motion", "c1"), now()).await.unwrap();
        repo.create(&motion("motion", "c2"), now()).await.unwrap();

        let err = repo.create(&motion("motion", "c1"), now()).await.unwrap_err();
        assert!(matches!(err, DomainError::DuplicateListener { ref name, .. } if name == "motion"));
    }

    #[tokio::test]
    async fn test_update_applies_only_given_fields() {
        let repo = setup().await;
        let created = repo.create(&motion("motion", "c1"), now()).await.unwrap();

        let update = ListenerUpdate {
            action: Some(ListenerAction::Script {
                code: "notify()".into(),
                config: json!({ "timeout": 5 }),
            }),
            one_time: Some(true),
            ..ListenerUpdate::default()
        };
        let updated = repo.update(created.id, &update).await.unwrap();

        assert!(updated.one_time);
        assert_eq!(updated.match_conditions, created.match_conditions);
        assert!(matches!(updated.action, ListenerAction::Script { ref code, .. } if code == "notify()"));

        let err = repo.update(999, &update).await.unwrap_err();
        assert!(matches!(err, DomainError::ListenerNotFound(999)));
    }

    #[tokio::test]
    async fn test_list_enabled_skips_disabled() {
        let repo = setup().await;
        let a = repo.create(&motion("a", "c1"), now()).await.unwrap();
        repo.create(&motion("b", "c1"), now()).await.unwrap();
        assert!(repo.set_enabled(a.id, false).await.unwrap());

        let enabled = repo.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "b");
        assert_eq!(repo.list(&ListenerFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_record_execution_caps_and_resets() {
        let repo = setup().await;
        let listener = repo.create(&motion("motion", "c1"), now()).await.unwrap();
        let midnight = Utc.with_ymd_and_hms(2026, 1, 11, 0, 0, 0).unwrap();

        assert_eq!(
            repo.record_execution(listener.id, "c1", 3, now(), midnight).await.unwrap(),
            ExecutionCount::Reset
        );
        assert_eq!(
            repo.record_execution(listener.id, "c1", 3, now(), midnight).await.unwrap(),
            ExecutionCount::Incremented(2)
        );
        assert_eq!(
            repo.record_execution(listener.id, "c1", 3, now(), midnight).await.unwrap(),
            ExecutionCount::Incremented(3)
        );
        assert_eq!(
            repo.record_execution(listener.id, "c1", 3, now(), midnight).await.unwrap(),
            ExecutionCount::LimitReached { executions: 3, resets_at: Some(midnight) }
        );

        let tomorrow = midnight + Duration::minutes(1);
        let next_midnight = midnight + Duration::days(1);
        assert_eq!(
            repo.record_execution(listener.id, "c1", 3, tomorrow, next_midnight).await.unwrap(),
            ExecutionCount::Reset
        );
    }

    #[tokio::test]
    async fn test_record_execution_checks_conversation() {
        let repo = setup().await;
        let listener = repo.create(&motion("motion", "c1"), now()).await.unwrap();
        assert_eq!(
            repo.record_execution(listener.id, "c2", 5, now(), now()).await.unwrap(),
            ExecutionCount::NotFound
        );
    }
}
