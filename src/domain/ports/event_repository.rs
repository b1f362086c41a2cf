use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::StoredEvent;

/// Repository port for the received-event log
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn record(&self, event: &StoredEvent) -> DomainResult<()>;

    async fn get(&self, event_id: &str) -> DomainResult<Option<StoredEvent>>;

    /// Most recent events first, optionally restricted to one source.
    async fn list_recent(
        &self,
        source_id: Option<&str>,
        limit: u32,
    ) -> DomainResult<Vec<StoredEvent>>;

    /// Delete events older than `cutoff`. Returns the number deleted.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> DomainResult<u64>;
}
