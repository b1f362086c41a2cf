//! Validated management of event listeners.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::listener::validate_conditions;
use crate::domain::models::{
    EventListener, ListenerFilter, ListenerUpdate, NewEventListener, RateLimitDecision,
};
use crate::domain::ports::ListenerRepository;
use crate::services::rate_limiter::RateLimiter;

pub struct ListenerService {
    repo: Arc<dyn ListenerRepository>,
    rate_limiter: RateLimiter,
}

impl ListenerService {
    pub const fn new(repo: Arc<dyn ListenerRepository>, rate_limiter: RateLimiter) -> Self {
        Self { repo, rate_limiter }
    }

    /// Create a listener after validating it. Names are unique per conversation.
    #[instrument(skip(self, listener), fields(name = %listener.name, source_id = %listener.source_id), err)]
    pub async fn create_event_listener(&self, listener: NewEventListener) -> DomainResult<EventListener> {
        listener.validate()?;
        let created = self.repo.create(&listener, Utc::now()).await?;
        info!(listener_id = created.id, conversation_id = %created.conversation_id, "Event listener created");
        Ok(created)
    }

    pub async fn get(&self, id: i64) -> DomainResult<EventListener> {
        self.repo.get(id).await?.ok_or(DomainError::ListenerNotFound(id))
    }

    pub async fn get_by_name(&self, conversation_id: &str, name: &str) -> DomainResult<Option<EventListener>> {
        self.repo.get_by_name(conversation_id, name).await
    }

    pub async fn list(&self, filter: &ListenerFilter) -> DomainResult<Vec<EventListener>> {
        self.repo.list(filter).await
    }

    pub async fn list_enabled(&self) -> DomainResult<Vec<EventListener>> {
        self.repo.list_enabled().await
    }

    #[instrument(skip(self, update), err)]
    pub async fn update(&self, id: i64, update: ListenerUpdate) -> DomainResult<EventListener> {
        if let Some(conditions) = &update.match_conditions {
            validate_conditions(conditions)?;
        }
        if let Some(action) = &update.action {
            action.validate()?;
        }
        let updated = self.repo.update(id, &update).await?;
        info!(listener_id = id, "Event listener updated");
        Ok(updated)
    }

    /// Enable or disable a listener. Fails with `ListenerNotFound`.
    #[instrument(skip(self), err)]
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> DomainResult<()> {
        if self.repo.set_enabled(id, enabled).await? {
            info!(listener_id = id, enabled, "Event listener toggled");
            Ok(())
        } else {
            Err(DomainError::ListenerNotFound(id))
        }
    }

    #[instrument(skip(self), err)]
    pub async fn delete(&self, id: i64) -> DomainResult<()> {
        if self.repo.delete(id).await? {
            info!(listener_id = id, "Event listener deleted");
            Ok(())
        } else {
            Err(DomainError::ListenerNotFound(id))
        }
    }

    pub async fn check_and_update_rate_limit(
        &self,
        listener_id: i64,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        self.rate_limiter
            .check_and_update_rate_limit(listener_id, conversation_id, now)
            .await
    }
}
