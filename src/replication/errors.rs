//! Replication error types
//!
//! Error codes:
//! - REV_REPL_NETWORK (ERROR, retryable) - transport failure
//! - REV_REPL_INTERRUPTED (ERROR, retryable) - response ended early
//! - REV_REPL_HTTP_STATUS (ERROR, terminal) - remote answered with a failure status
//! - REV_REPL_MALFORMED (ERROR) - unparseable feed entry or document
//! - REV_REPL_MULTIPART (ERROR) - broken multipart framing or attachments
//! - REV_REPL_STORE (per store error) - local insertion failed
//! - REV_REPL_CONFIG (ERROR) - invalid replication configuration
//! - REV_REPL_STOPPED (INFO) - work abandoned because the session stopped
//!
//! Transport failures are retried with backoff by the change feed. An HTTP
//! failure status stops the feed and is reported to its owner.

use thiserror::Error;

use super::multipart::MultipartError;
use crate::store::StoreError;

/// Errors raised by the replication pipeline.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("response interrupted: {0}")]
    Interrupted(String),

    #[error("remote returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid replication configuration: {0}")]
    Config(String),

    #[error("replication stopped")]
    Stopped,
}

impl ReplicationError {
    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            ReplicationError::Network(_) => "REV_REPL_NETWORK",
            ReplicationError::Interrupted(_) => "REV_REPL_INTERRUPTED",
            ReplicationError::HttpStatus { .. } => "REV_REPL_HTTP_STATUS",
            ReplicationError::Malformed(_) => "REV_REPL_MALFORMED",
            ReplicationError::Multipart(_) => "REV_REPL_MULTIPART",
            ReplicationError::Store(_) => "REV_REPL_STORE",
            ReplicationError::Config(_) => "REV_REPL_CONFIG",
            ReplicationError::Stopped => "REV_REPL_STOPPED",
        }
    }

    /// True for transient failures that the change feed retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Network(_) | ReplicationError::Interrupted(_)
        )
    }

    /// True if the error must stop the whole pull rather than one document.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplicationError::Store(err) if err.is_fatal())
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ReplicationError::Malformed(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ReplicationError::Config(message.into())
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;
