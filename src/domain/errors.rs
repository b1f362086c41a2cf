//! Domain errors for the Conduit queue and automation engine.

use thiserror::Error;

/// Domain-level errors that can occur in the Conduit system.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task with id '{0}' already exists")]
    DuplicateTask(String),

    #[error("An event listener named '{name}' already exists in this conversation")]
    DuplicateListener { name: String, conversation_id: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Event listener not found: {0}")]
    ListenerNotFound(i64),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DomainError {
    /// Whether this error is caused by caller input rather than by storage.
    ///
    /// User-facing surfaces print these as plain text; everything else is
    /// reported as an internal failure.
    pub const fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::DuplicateTask(_)
                | Self::DuplicateListener { .. }
                | Self::TaskNotFound(_)
                | Self::ListenerNotFound(_)
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

/// Returns true when a sqlx error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_classification() {
        assert!(DomainError::Validation("bad".into()).is_user_facing());
        assert!(DomainError::DuplicateListener {
            name: "door".into(),
            conversation_id: "c1".into(),
        }
        .is_user_facing());
        assert!(!DomainError::DatabaseError("locked".into()).is_user_facing());
    }

    #[test]
    fn test_duplicate_listener_message_is_plain_text() {
        let err = DomainError::DuplicateListener {
            name: "door".into(),
            conversation_id: "c1".into(),
        };
        assert!(err.to_string().contains("already exists"));
    }
}
