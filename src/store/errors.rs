//! Store error types
//!
//! Error codes:
//! - REV_STORE_NOT_FOUND (ERROR) - a named parent/document does not exist
//! - REV_STORE_CONFLICT (ERROR) - local write's parent is not a current leaf
//! - REV_STORE_VALIDATION_REJECTED (ERROR) - validation hook vetoed
//! - REV_STORE_MALFORMED (ERROR) - unusable revision id or body
//! - REV_STORE_CONFIG (ERROR) - invalid store configuration
//! - REV_STORE_INTERNAL (FATAL) - invariant violation; transaction rolled back
//!
//! Absent documents on the read path are `Option::None`, never an error.

use thiserror::Error;

/// Severity levels for store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, store continues
    Error,
    /// Invariant violated; surfaced as a hard failure
    Fatal,
}

/// Reason given by a validation hook for vetoing a revision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ValidationError {
    reason: String,
}

impl ValidationError {
    /// Create a rejection with a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The rejection reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Errors returned by [`DocumentStore`](super::DocumentStore) mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The document or named parent revision does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The parent revision is not a current leaf and conflicts were not allowed.
    #[error("conflict on document '{doc_id}'")]
    Conflict { doc_id: String },

    /// The validation hook vetoed the revision.
    #[error("validation rejected revision {rev_id} of '{doc_id}': {source}")]
    ValidationRejected {
        doc_id: String,
        rev_id: String,
        #[source]
        source: ValidationError,
    },

    /// A revision id, history or body could not be used.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Store configuration is invalid.
    #[error("invalid store configuration: {0}")]
    Config(String),

    /// An invariant was violated. Never swallowed.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "REV_STORE_NOT_FOUND",
            StoreError::Conflict { .. } => "REV_STORE_CONFLICT",
            StoreError::ValidationRejected { .. } => "REV_STORE_VALIDATION_REJECTED",
            StoreError::Malformed(_) => "REV_STORE_MALFORMED",
            StoreError::Config(_) => "REV_STORE_CONFIG",
            StoreError::Internal(_) => "REV_STORE_INTERNAL",
        }
    }

    /// Severity of this error
    pub fn severity(&self) -> Severity {
        match self {
            StoreError::Internal(_) => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Returns true if this error must not be recovered locally.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    pub(crate) fn conflict(doc_id: &str) -> Self {
        StoreError::Conflict {
            doc_id: doc_id.to_string(),
        }
    }

    pub(crate) fn rejected(doc_id: &str, rev_id: &str, source: ValidationError) -> Self {
        StoreError::ValidationRejected {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            source,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_internal_is_fatal() {
        assert!(StoreError::Internal("x".into()).is_fatal());
        assert!(!StoreError::conflict("d").is_fatal());
        assert!(!StoreError::NotFound("d".into()).is_fatal());
        assert!(!StoreError::rejected("d", "1-a", ValidationError::new("no")).is_fatal());
    }

    #[test]
    fn test_codes() {
        assert_eq!(StoreError::conflict("d").code(), "REV_STORE_CONFLICT");
        assert_eq!(StoreError::Malformed("x".into()).code(), "REV_STORE_MALFORMED");
    }

    #[test]
    fn test_rejection_display_includes_reason() {
        let err = StoreError::rejected("doc", "2-b", ValidationError::new("missing owner"));
        let text = err.to_string();
        assert!(text.contains("doc"));
        assert!(text.contains("2-b"));
        assert!(text.contains("missing owner"));
    }
}
