//! Error types and result handling for persistence and admission.
//!
//! Separates validation, lookup and constraint failures from opaque storage
//! failures, and assigns each a stable code so callers of the admission path
//! can tell them apart without inspecting messages.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found, or outside the retention window.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Input rejected before any mutation, or a write that failed in storage.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Table name that does not follow the `{table}__{yyyy_mm_dd}` layout.
    #[error("Invalid partition name: {0}")]
    InvalidPartitionName(String),
}

impl CoreError {
    /// Returns the stable error code reported to admission callers.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E1001",
            Self::NotFound(_) => "E1002",
            Self::ConstraintViolation(_) => "E1003",
            Self::InvalidPartitionName(_) => "E1004",
            Self::Database(_) => "E3001",
        }
    }

    /// Collapses storage failures on a write path into a validation error.
    ///
    /// Not-found stays distinct so lookups made while admitting an event
    /// still report which entity was missing.
    pub fn into_write_error(self) -> Self {
        match self {
            Self::Database(msg) | Self::ConstraintViolation(msg) => Self::Validation(msg),
            other => other,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(CoreError::Validation("bad".into()).code(), "E1001");
        assert_eq!(CoreError::NotFound("event".into()).code(), "E1002");
        assert_eq!(CoreError::ConstraintViolation("dup".into()).code(), "E1003");
        assert_eq!(CoreError::InvalidPartitionName("t".into()).code(), "E1004");
        assert_eq!(CoreError::Database("down".into()).code(), "E3001");
    }

    #[test]
    fn write_errors_hide_storage_details() {
        let err = CoreError::Database("relation does not exist".into()).into_write_error();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = CoreError::ConstraintViolation("fk".into()).into_write_error();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = CoreError::NotFound("topic".into()).into_write_error();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
