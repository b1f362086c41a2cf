//! Per-listener daily execution caps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, error};

use crate::domain::models::{next_local_midnight, ExecutionCount, RateLimitDecision};
use crate::domain::ports::ListenerRepository;

/// Counts listener executions per local day and refuses those over the cap.
///
/// Storage failures never block a listener: they come back as
/// `RateLimitDecision::Degraded`, which permits the execution.
#[derive(Clone)]
pub struct RateLimiter {
    repo: Arc<dyn ListenerRepository>,
    max_daily_executions: u32,
    timezone: Tz,
}

impl RateLimiter {
    pub fn new(repo: Arc<dyn ListenerRepository>, max_daily_executions: u32, timezone: Tz) -> Self {
        Self {
            repo,
            max_daily_executions,
            timezone,
        }
    }

    pub const fn max_daily_executions(&self) -> u32 {
        self.max_daily_executions
    }

    /// Check the cap for `listener_id` within `conversation_id` and count
    /// this execution if allowed.
    pub async fn check_and_update_rate_limit(
        &self,
        listener_id: i64,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let next_reset_at = next_local_midnight(now, self.timezone);
        let counted = self
            .repo
            .record_execution(
                listener_id,
                conversation_id,
                self.max_daily_executions,
                now,
                next_reset_at,
            )
            .await;

        match counted {
            Ok(ExecutionCount::Reset) => RateLimitDecision::Allowed { executions: 1 },
            Ok(ExecutionCount::Incremented(executions)) => RateLimitDecision::Allowed { executions },
            Ok(ExecutionCount::LimitReached { executions, resets_at }) => {
                let resets = resets_at.map_or_else(
                    || "at the next local midnight".to_string(),
                    |at| format!("at {}", at.with_timezone(&self.timezone).to_rfc3339()),
                );
                debug!(listener_id, executions, "Listener daily limit reached");
                RateLimitDecision::Denied {
                    reason: format!(
                        "Daily limit of {} executions reached; resets {resets}",
                        self.max_daily_executions
                    ),
                }
            }
            Ok(ExecutionCount::NotFound) => RateLimitDecision::Denied {
                reason: format!("Listener {listener_id} not found in this conversation"),
            },
            Err(err) => {
                error!(listener_id, conversation_id, error = %err, "Rate limit check failed, allowing execution");
                RateLimitDecision::Degraded {
                    error: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteListenerRepository};
    use crate::domain::errors::{DomainError, DomainResult};
    use crate::domain::models::{
        EventListener, ListenerAction, ListenerFilter, ListenerUpdate, NewEventListener,
    };
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use chrono_tz::Australia::Sydney;

    async fn setup() -> (RateLimiter, i64) {
        let repo = Arc::new(SqliteListenerRepository::new(create_migrated_test_pool().await.unwrap()));
        let listener = repo
            .create(
                &NewEventListener::new(
                    "door",
                    "home_assistant",
                    ListenerAction::WakeLlm { context: None },
                    "c1",
                    "telegram",
                ),
                Utc::now(),
            )
            .await
            .unwrap();
        (RateLimiter::new(repo, 5, Sydney), listener.id)
    }

    #[tokio::test]
    async fn test_five_allowed_then_denied_until_local_midnight() {
        let (limiter, id) = setup().await;
        // 09:00 AEDT on 10 Jan.
        let morning = Utc.with_ymd_and_hms(2026, 1, 9, 22, 0, 0).unwrap();

        for expected in 1..=5 {
            let decision = limiter.check_and_update_rate_limit(id, "c1", morning).await;
            assert_eq!(decision, RateLimitDecision::Allowed { executions: expected });
        }

        let sixth = limiter.check_and_update_rate_limit(id, "c1", morning).await;
        assert!(matches!(&sixth, RateLimitDecision::Denied { reason } if reason.contains("Daily limit of 5")));

        // Still the same local day at 23:59 AEDT.
        let late = Utc.with_ymd_and_hms(2026, 1, 10, 12, 59, 0).unwrap();
        assert!(!limiter.check_and_update_rate_limit(id, "c1", late).await.permits());

        // 00:01 AEDT on 11 Jan.
        let after_midnight = late + Duration::minutes(2);
        assert_eq!(
            limiter.check_and_update_rate_limit(id, "c1", after_midnight).await,
            RateLimitDecision::Allowed { executions: 1 }
        );
    }

    /// Store whose every call fails, as when the database file is unavailable.
    struct Unavailable;

    fn unavailable() -> DomainError {
        DomainError::DatabaseError("unable to open database file".to_string())
    }

    #[async_trait]
    impl ListenerRepository for Unavailable {
        async fn create(&self, _: &NewEventListener, _: DateTime<Utc>) -> DomainResult<EventListener> {
            Err(unavailable())
        }
        async fn get(&self, _: i64) -> DomainResult<Option<EventListener>> {
            Err(unavailable())
        }
        async fn get_by_name(&self, _: &str, _: &str) -> DomainResult<Option<EventListener>> {
            Err(unavailable())
        }
        async fn list(&self, _: &ListenerFilter) -> DomainResult<Vec<EventListener>> {
            Err(unavailable())
        }
        async fn list_enabled(&self) -> DomainResult<Vec<EventListener>> {
            Err(unavailable())
        }
        async fn update(&self, _: i64, _: &ListenerUpdate) -> DomainResult<EventListener> {
            Err(unavailable())
        }
        async fn set_enabled(&self, _: i64, _: bool) -> DomainResult<bool> {
            Err(unavailable())
        }
        async fn delete(&self, _: i64) -> DomainResult<bool> {
            Err(unavailable())
        }
        async fn record_execution(
            &self,
            _: i64,
            _: &str,
            _: u32,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> DomainResult<ExecutionCount> {
            Err(unavailable())
        }
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_and_permits() {
        let limiter = RateLimiter::new(Arc::new(Unavailable), 5, Sydney);

        let decision = limiter.check_and_update_rate_limit(7, "c1", Utc::now()).await;
        assert!(matches!(&decision, RateLimitDecision::Degraded { error } if error.contains("unable to open")));
        assert!(decision.permits());
    }

    #[tokio::test]
    async fn test_other_conversation_is_denied() {
        let (limiter, id) = setup().await;
        let decision = limiter.check_and_update_rate_limit(id, "c2", Utc::now()).await;
        assert!(matches!(decision, RateLimitDecision::Denied { reason } if reason.contains("not found")));
    }
}
