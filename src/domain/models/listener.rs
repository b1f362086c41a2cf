//! Event listener domain model.
//!
//! A listener pairs a source and a set of dotted-path match conditions with
//! an action. Listeners are scoped to the conversation that created them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::errors::{DomainError, DomainResult};

/// What a listener does when an event matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerAction {
    /// Enqueue an `llm_callback` that wakes the conversation.
    WakeLlm {
        /// Extra instructions carried into the callback trigger text.
        #[serde(default)]
        context: Option<String>,
    },
    /// Enqueue a `script_execution` task.
    Script {
        code: String,
        /// Remaining action configuration, handed to the script runner as is.
        /// Always a JSON object.
        #[serde(default = "empty_config")]
        config: Value,
    },
}

fn empty_config() -> Value {
    Value::Object(Map::new())
}

impl ListenerAction {
    pub const fn action_type(&self) -> &'static str {
        match self {
            Self::WakeLlm { .. } => "wake_llm",
            Self::Script { .. } => "script",
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let Self::Script { code, config } = self {
            if code.trim().is_empty() {
                return Err(DomainError::Validation("script_code cannot be empty".to_string()));
            }
            if !config.is_object() {
                return Err(DomainError::Validation(
                    "script config must be a JSON object".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Split into the `(action_type, action_config)` column pair.
    pub fn to_columns(&self) -> (&'static str, Option<Value>) {
        match self {
            Self::WakeLlm { context } => (
                "wake_llm",
                context
                    .as_ref()
                    .map(|c| serde_json::json!({ "context": c })),
            ),
            Self::Script { code, config } => {
                let mut map = config.as_object().cloned().unwrap_or_default();
                map.insert("script_code".to_string(), Value::String(code.clone()));
                ("script", Some(Value::Object(map)))
            }
        }
    }

    /// Rebuild from the `(action_type, action_config)` column pair.
    pub fn from_columns(action_type: &str, config: Option<Value>) -> DomainResult<Self> {
        match action_type {
            "wake_llm" => {
                let context = config
                    .as_ref()
                    .and_then(|c| c.get("context"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Self::WakeLlm { context })
            }
            "script" => {
                let mut map = match config {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                let code = match map.remove("script_code") {
                    Some(Value::String(code)) => code,
                    _ => {
                        return Err(DomainError::Validation(
                            "script listeners require action_config.script_code".to_string(),
                        ))
                    }
                };
                Ok(Self::Script {
                    code,
                    config: Value::Object(map),
                })
            }
            other => Err(DomainError::Validation(format!(
                "unknown action_type '{other}' (expected wake_llm or script)"
            ))),
        }
    }
}

/// A persisted event listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventListener {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub source_id: String,
    /// Flat mapping of dotted path to expected scalar.
    pub match_conditions: Map<String, Value>,
    pub action: ListenerAction,
    pub conversation_id: String,
    pub interface_type: String,
    pub enabled: bool,
    pub one_time: bool,
    pub daily_executions: u32,
    pub daily_reset_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Request to create a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEventListener {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source_id: String,
    #[serde(default)]
    pub match_conditions: Map<String, Value>,
    pub action: ListenerAction,
    pub conversation_id: String,
    pub interface_type: String,
    #[serde(default)]
    pub one_time: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl NewEventListener {
    pub fn new(
        name: impl Into<String>,
        source_id: impl Into<String>,
        action: ListenerAction,
        conversation_id: impl Into<String>,
        interface_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            source_id: source_id.into(),
            match_conditions: Map::new(),
            action,
            conversation_id: conversation_id.into(),
            interface_type: interface_type.into(),
            one_time: false,
            enabled: true,
        }
    }

    // Builder methods
    pub fn with_condition(mut self, path: impl Into<String>, expected: Value) -> Self {
        self.match_conditions.insert(path.into(), expected);
        self
    }

    pub fn with_conditions(mut self, conditions: Map<String, Value>) -> Self {
        self.match_conditions = conditions;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn one_time(mut self) -> Self {
        self.one_time = true;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::Validation("listener name cannot be empty".to_string()));
        }
        if self.source_id.trim().is_empty() {
            return Err(DomainError::Validation("source_id cannot be empty".to_string()));
        }
        if self.conversation_id.trim().is_empty() {
            return Err(DomainError::Validation("conversation_id cannot be empty".to_string()));
        }
        validate_conditions(&self.match_conditions)?;
        self.action.validate()
    }
}

/// Conditions must be a flat path -> scalar mapping.
pub fn validate_conditions(conditions: &Map<String, Value>) -> DomainResult<()> {
    for (path, expected) in conditions {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(DomainError::Validation(format!(
                "invalid condition path '{path}'"
            )));
        }
        if expected.is_object() || expected.is_array() {
            return Err(DomainError::Validation(format!(
                "condition '{path}' must compare against a scalar value"
            )));
        }
    }
    Ok(())
}

/// Partial update for an existing listener.
#[derive(Debug, Clone, Default)]
pub struct ListenerUpdate {
    pub description: Option<String>,
    pub match_conditions: Option<Map<String, Value>>,
    pub action: Option<ListenerAction>,
    pub one_time: Option<bool>,
    pub enabled: Option<bool>,
}

/// Filter for listing listeners.
#[derive(Debug, Clone, Default)]
pub struct ListenerFilter {
    pub conversation_id: Option<String>,
    pub source_id: Option<String>,
    pub enabled_only: bool,
}

/// Outcome of a rate limit check.
///
/// `Degraded` means the check itself failed; callers proceed as if allowed
/// and surface the error to observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { executions: u32 },
    Denied { reason: String },
    Degraded { error: String },
}

impl RateLimitDecision {
    pub const fn permits(&self) -> bool {
        matches!(self, Self::Allowed { .. } | Self::Degraded { .. })
    }

    /// Legacy `(allowed, reason)` view.
    pub fn as_tuple(&self) -> (bool, String) {
        match self {
            Self::Allowed { executions } => (true, format!("Execution {executions} today")),
            Self::Denied { reason } => (false, reason.clone()),
            Self::Degraded { error } => (true, format!("Rate limit check failed, allowing: {error}")),
        }
    }
}

/// Result of the store-level counter update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionCount {
    /// Counter was reset for a new local day; this is execution 1.
    Reset,
    /// Counter incremented to the contained value.
    Incremented(u32),
    /// Already at the cap; nothing changed.
    LimitReached {
        executions: u32,
        resets_at: Option<DateTime<Utc>>,
    },
    /// No listener with this id in this conversation.
    NotFound,
}
