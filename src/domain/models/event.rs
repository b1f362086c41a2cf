//! Received events, kept for audit and for sampling real payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An event as recorded in the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub source_id: String,
    pub event_data: Value,
    /// Listeners that matched and were allowed to fire.
    pub triggered_listener_ids: Vec<i64>,
    pub timestamp: DateTime<Utc>,
}

impl StoredEvent {
    pub fn new(
        source_id: impl Into<String>,
        event_data: Value,
        triggered_listener_ids: Vec<i64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            event_data,
            triggered_listener_ids,
            timestamp,
        }
    }
}
