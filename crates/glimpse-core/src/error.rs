//! Error types for the glimpse pipeline.

use thiserror::Error;

use crate::models::Capability;

/// Result type alias using glimpse's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for glimpse pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Task row not found
    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    /// External model provider call failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// External call exceeded its capability budget
    #[error("{capability} call timed out after {after_ms}ms")]
    Timeout { capability: Capability, after_ms: u64 },

    /// Provider configuration failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Capture control callback failed
    #[error("Capture control error: {0}")]
    Capture(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_task_not_found() {
        let err = Error::TaskNotFound(42);
        assert_eq!(err.to_string(), "Task not found: 42");
    }

    #[test]
    fn test_error_display_provider() {
        let err = Error::Provider("429 too many requests".to_string());
        assert_eq!(err.to_string(), "Provider error: 429 too many requests");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout {
            capability: Capability::Vlm,
            after_ms: 1500,
        };
        assert_eq!(err.to_string(), "vlm call timed out after 1500ms");
    }

    #[test]
    fn test_error_display_validation() {
        let err = Error::Validation("missing model".to_string());
        assert_eq!(err.to_string(), "Validation error: missing model");
    }

    #[test]
    fn test_error_display_capture() {
        let err = Error::Capture("recorder busy".to_string());
        assert_eq!(err.to_string(), "Capture control error: recorder busy");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("concurrency must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: concurrency must be positive"
        );
    }

    #[test]
    fn test_error_display_invalid_input() {
        let err = Error::InvalidInput("limit must be positive".to_string());
        assert_eq!(err.to_string(), "Invalid input: limit must be positive");
    }

    #[test]
    fn test_error_display_internal() {
        let err = Error::Internal("unexpected state".to_string());
        assert_eq!(err.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number");
        assert!(json_err.is_err());

        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::Serialization(msg) => {
                assert!(!msg.is_empty());
            }
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_sqlx_error() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::Database(_)));
        assert!(err.to_string().starts_with("Database error:"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn test_error_debug_format() {
        let err = Error::TaskNotFound(7);
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("TaskNotFound"));
    }
}
