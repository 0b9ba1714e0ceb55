use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embeddings::EmbeddingError;

pub type RecallResult<T> = Result<T, RecallError>;

/// Coarse error classification that survives wrapping.
///
/// Callers decide retry policy from the kind, never from the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad provider, dimension or collection setup. Fatal, not retried.
    Configuration,
    /// Transient I/O or connectivity failure. Retry with backoff.
    StoreUnavailable,
    /// Lookup miss. Recoverable, never retried.
    NotFound,
    /// Id collision on insert. Recoverable by regenerating the id.
    DuplicateId,
    /// Bad caller input. Fatal for that call.
    InvalidArgument,
    /// Bounded wait exceeded. Retryable.
    Timeout,
    /// Stored metadata could not be decoded into a session.
    CorruptRecord,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DuplicateId => "duplicate_id",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CorruptRecord => "corrupt_record",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::StoreUnavailable | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum RecallError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("{context}: {source}")]
    Repository {
        context: String,
        #[source]
        source: Box<RecallError>,
    },
}

impl RecallError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        RecallError::InvalidArgument(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        RecallError::Configuration(msg.into())
    }

    /// Wrap with repository context. The kind of `self` is preserved.
    pub fn context(self, context: impl Into<String>) -> Self {
        RecallError::Repository {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The kind of the innermost error, looking through `Repository` wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecallError::Configuration(_) | RecallError::Config(_) => ErrorKind::Configuration,
            RecallError::StoreUnavailable(e) => match e {
                sqlx::Error::Configuration(_) => ErrorKind::Configuration,
                sqlx::Error::PoolTimedOut => ErrorKind::Timeout,
                _ => ErrorKind::StoreUnavailable,
            },
            RecallError::Io(_) => ErrorKind::StoreUnavailable,
            RecallError::Embedding(e) => e.kind(),
            RecallError::NotFound(_) => ErrorKind::NotFound,
            RecallError::DuplicateId(_) => ErrorKind::DuplicateId,
            RecallError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RecallError::Timeout { .. } => ErrorKind::Timeout,
            RecallError::CorruptRecord { .. } => ErrorKind::CorruptRecord,
            RecallError::Repository { source, .. } => source.kind(),
        }
    }

    /// The innermost error, looking through `Repository` wrappers.
    pub fn root(&self) -> &RecallError {
        match self {
            RecallError::Repository { source, .. } => source.root(),
            other => other,
        }
    }
}
