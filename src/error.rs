/// Error taxonomy for the workflow control plane
///
/// Every failure surfaced to a caller maps onto one of the RPC status codes in
/// `ErrorCode`. Store and serialization failures collapse into `Internal`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Canonical status codes exposed to clients and recorded on failed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Aborted,
    Internal,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for lifecycle operations
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LifecycleError {
    /// Status code reported to clients for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            LifecycleError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            LifecycleError::NotFound(_) => ErrorCode::NotFound,
            LifecycleError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            LifecycleError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            LifecycleError::Aborted(_) => ErrorCode::Aborted,
            LifecycleError::Cancelled(_) => ErrorCode::Cancelled,
            LifecycleError::Internal(_)
            | LifecycleError::Database(_)
            | LifecycleError::Serialization(_) => ErrorCode::Internal,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        LifecycleError::InvalidArgument(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_report_internal() {
        let err: LifecycleError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn codes_serialize_as_status_names() {
        let json = serde_json::to_string(&ErrorCode::FailedPrecondition).unwrap();
        assert_eq!(json, "\"FAILED_PRECONDITION\"");
        assert_eq!(ErrorCode::AlreadyExists.to_string(), "ALREADY_EXISTS");
    }
}
