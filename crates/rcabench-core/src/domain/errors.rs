//! Error types and their operational classification.
//!
//! Handlers return a `CoreError`; the scheduler looks at `ErrorKind` alone
//! to make the retry/dead decision. Retry logic lives in one place, never
//! inside handlers.

use thiserror::Error;

use super::ids::TaskId;
use super::task::TaskType;
use crate::ports::kv_store::StoreError;

/// Operational classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request, unknown type, payload mismatch. Not retried.
    Validation,

    /// KV/relational I/O, adapter timeouts. Retried with backoff.
    Transient,

    /// Logical failure with an explicit non-retry signal. Not retried.
    Permanent,

    /// User- or shutdown-initiated. Not retried.
    Cancelled,

    /// Integrity violation (missing parent trace, corrupt envelope).
    /// The affected pipeline terminates; others continue.
    Inconsistency,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("inconsistency: {0}")]
    Inconsistency(String),

    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("handler not found for task_type={0}")]
    HandlerNotFound(TaskType),

    #[error("{context}: {source}")]
    Codec {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::Inconsistency(msg.into())
    }

    pub fn encode(source: serde_json::Error) -> Self {
        Self::Codec {
            context: "encode",
            source,
        }
    }

    pub fn decode(source: serde_json::Error) -> Self {
        Self::Codec {
            context: "decode",
            source,
        }
    }

    /// The classification the scheduler acts on.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) | CoreError::AlreadyExists(_) => ErrorKind::Validation,
            CoreError::Transient(_) => ErrorKind::Transient,
            CoreError::Permanent(_) | CoreError::HandlerNotFound(_) => ErrorKind::Permanent,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            CoreError::Inconsistency(_) | CoreError::Codec { .. } => ErrorKind::Inconsistency,
            CoreError::Store(e) => match e {
                StoreError::Io(_) => ErrorKind::Transient,
                StoreError::NotFound { .. } | StoreError::Corrupt(_) => ErrorKind::Inconsistency,
            },
        }
    }

    /// Whether the scheduler may park this for retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_drive_retry() {
        assert!(CoreError::transient("net down").is_retryable());
        assert!(!CoreError::permanent("image missing").is_retryable());
        assert!(!CoreError::cancelled("shutdown").is_retryable());
        assert!(!CoreError::validation("bad payload").is_retryable());
    }

    #[test]
    fn store_io_is_transient() {
        let err = CoreError::Store(StoreError::Io("connection reset".into()));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn store_not_found_is_inconsistency() {
        let err = CoreError::Store(StoreError::NotFound {
            key: "task:index".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Inconsistency);
    }
}
