//! Error taxonomy of the consistency layer.

use std::fmt;

use clipstream_storage::StorageError;

use crate::cache::CacheError;

/// Errors returned by loaders, the counter engine and the services.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The entity does not exist. Not retried.
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: i64 },

    /// A membership index was still missing after one rebuild.
    #[error("cache index {key} is not warmed")]
    NotWarmed { key: String },

    /// The requested state already holds ("already liked").
    #[error("already {action}")]
    AlreadyApplied { action: &'static str },

    /// The request itself is invalid.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Another caller holds the rebuild lock; retry shortly.
    #[error("rebuild of {key} in progress, try again shortly")]
    LockBusy { key: String },

    #[error("internal error: {message}")]
    Internal { message: String, retryable: bool },
}

impl CoreError {
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: i64) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id,
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if retrying the whole operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockBusy { .. } => true,
            Self::Internal { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyApplied { .. } | Self::InvalidInput { .. } => ErrorCategory::Validation,
            Self::LockBusy { .. } => ErrorCategory::Retry,
            Self::NotWarmed { .. } | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<CacheError> for CoreError {
    fn from(err: CacheError) -> Self {
        let retryable = matches!(err, CacheError::Timeout { .. } | CacheError::Connection(_));
        Self::Internal {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { table, id } => Self::NotFound { kind: table, id },
            StorageError::InvalidRow { message } => Self::InvalidInput { message },
            StorageError::AlreadyExists { .. } => Self::invalid_input(err.to_string()),
            StorageError::ConnectionError { .. } => Self::Internal {
                message: err.to_string(),
                retryable: true,
            },
            _ => Self::internal(err.to_string()),
        }
    }
}

/// Categories of core errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    /// Rejected request (already applied, invalid input).
    Validation,
    /// Transient contention; back off and retry.
    Retry,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Validation => write!(f, "validation"),
            Self::Retry => write!(f, "retry"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_is_retryable_internal() {
        let err: CoreError = CacheError::Timeout {
            op: "hgetall",
            elapsed: Duration::from_millis(500),
        }
        .into();
        assert!(matches!(err, CoreError::Internal { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Internal);

        let err: CoreError = CacheError::Command("ERR syntax".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_conversion() {
        let err: CoreError = StorageError::not_found("videos", 42).into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "videos 42 not found");

        let err: CoreError = StorageError::already_exists("users", "username=bob").into();
        assert_eq!(err.category(), ErrorCategory::Validation);

        let err: CoreError = StorageError::connection_error("refused").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            CoreError::LockBusy { key: "k".into() }.category(),
            ErrorCategory::Retry
        );
        assert!(CoreError::LockBusy { key: "k".into() }.is_retryable());
        assert_eq!(
            CoreError::AlreadyApplied { action: "liked" }.to_string(),
            "already liked"
        );
        assert_eq!(ErrorCategory::Validation.to_string(), "validation");
    }
}
