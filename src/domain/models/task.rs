//! Task record domain model.
//!
//! A task record is one durable row of queued work. The queue treats the
//! payload as opaque JSON; only the registered handler for `task_type`
//! interprets it.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// Task type enqueued when a listener wakes the conversational LLM.
pub const LLM_CALLBACK_TASK_TYPE: &str = "llm_callback";
/// Task type enqueued when a listener runs a script.
pub const SCRIPT_EXECUTION_TASK_TYPE: &str = "script_execution";
/// Legacy task-id prefix that implies singleton (upsert) semantics.
pub const SYSTEM_TASK_PREFIX: &str = "system_";
/// Marker embedded in the task id of every spawned recurrence sibling.
pub const RECURRENCE_MARKER: &str = "_recur_";

/// Status of a task row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly scheduled for later).
    #[default]
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Handler finished successfully.
    Completed,
    /// Terminal failure: retries exhausted or cancelled.
    Failed,
}

impl TaskStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub internal_id: i64,
    pub task_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// `None` means "run as soon as possible".
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub recurrence_rule: Option<String>,
    /// Groups every occurrence of a recurring series.
    pub original_task_id: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Slot this row was first scheduled for. Retries move `scheduled_at`
    /// but never this.
    #[serde(default)]
    pub occurrence_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Whether `dequeue` may still hand this row out.
    pub const fn has_retry_budget(&self) -> bool {
        self.retry_count <= self.max_retries
    }

    /// The series this row belongs to (its own id when it started one).
    pub fn series_id(&self) -> &str {
        self.original_task_id.as_deref().unwrap_or(&self.task_id)
    }

    pub const fn is_recurring(&self) -> bool {
        self.recurrence_rule.is_some()
    }
}

/// Request to enqueue a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub recurrence_rule: Option<String>,
    #[serde(default)]
    pub original_task_id: Option<String>,
    /// Re-registration replaces the stored row instead of failing.
    #[serde(default)]
    pub singleton: bool,
}

impl NewTask {
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload,
            scheduled_at: None,
            max_retries: None,
            recurrence_rule: None,
            original_task_id: None,
            singleton: false,
        }
    }

    // Builder methods
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_recurrence(mut self, rule: impl Into<String>) -> Self {
        self.recurrence_rule = Some(rule.into());
        self
    }

    pub fn in_series(mut self, original_task_id: impl Into<String>) -> Self {
        self.original_task_id = Some(original_task_id.into());
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.task_id.trim().is_empty() {
            return Err(DomainError::Validation("task_id cannot be empty".to_string()));
        }
        if self.task_type.trim().is_empty() {
            return Err(DomainError::Validation("task_type cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Filter for listing task rows.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub original_task_id: Option<String>,
    pub limit: Option<u32>,
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    pub const fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Parse a caller-supplied timestamp, refusing values without an offset.
///
/// Naive timestamps are ambiguous (whose wall clock?) and are rejected before
/// they can reach storage. Offset-bearing values are normalized to UTC.
pub fn parse_scheduled_at(raw: &str) -> DomainResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Accept a space separator and offsets without a colon as long as an
    // offset is present.
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(raw, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    if chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
    {
        return Err(DomainError::Validation(format!(
            "scheduled_at '{raw}' has no timezone information"
        )));
    }
    Err(DomainError::Validation(format!(
        "scheduled_at '{raw}' is not a valid RFC3339 timestamp"
    )))
}
