//! Repository port for event listeners.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    EventListener, ExecutionCount, ListenerFilter, ListenerUpdate, NewEventListener,
};

/// Repository for persisting and querying event listeners.
#[async_trait]
pub trait ListenerRepository: Send + Sync {
    /// Create a listener. Fails with `DuplicateListener` when the name is
    /// already used in the conversation.
    async fn create(
        &self,
        listener: &NewEventListener,
        now: DateTime<Utc>,
    ) -> DomainResult<EventListener>;

    async fn get(&self, id: i64) -> DomainResult<Option<EventListener>>;

    async fn get_by_name(
        &self,
        conversation_id: &str,
        name: &str,
    ) -> DomainResult<Option<EventListener>>;

    async fn list(&self, filter: &ListenerFilter) -> DomainResult<Vec<EventListener>>;

    /// List only enabled listeners.
    async fn list_enabled(&self) -> DomainResult<Vec<EventListener>>;

    /// Apply a partial update. Fails with `ListenerNotFound`.
    async fn update(&self, id: i64, update: &ListenerUpdate) -> DomainResult<EventListener>;

    async fn set_enabled(&self, id: i64, enabled: bool) -> DomainResult<bool>;

    async fn delete(&self, id: i64) -> DomainResult<bool>;

    /// Count one execution against the listener's daily cap.
    ///
    /// Resets the counter to 1 and moves the reset boundary to `next_reset_at`
    /// when the stored boundary has passed; otherwise increments while below
    /// `cap`. Each step is a single conditional statement.
    async fn record_execution(
        &self,
        id: i64,
        conversation_id: &str,
        cap: u32,
        now: DateTime<Utc>,
        next_reset_at: DateTime<Utc>,
    ) -> DomainResult<ExecutionCount>;
}
