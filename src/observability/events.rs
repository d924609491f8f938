//! Observable events
//!
//! Every lifecycle event the store and the replicator log is named here.
//! Events are explicit and typed so log consumers can match on stable
//! strings.

use std::fmt;

/// Observable events in revdb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Store lifecycle
    /// Store opened through the factory
    StoreOpened,
    /// Store closed
    StoreClosed,

    // Transactions
    /// Outermost transaction committed
    TransactionCommit,
    /// Outermost transaction rolled back
    TransactionRollback,

    // Revision insertion
    /// Local write committed a new revision
    RevisionPut,
    /// Replicated revision inserted
    RevisionForceInserted,
    /// Validation hook vetoed a revision
    RevisionRejected,
    /// Insertion hit an invariant violation
    RevisionInternalError,

    // Maintenance
    /// Compaction pass
    Compaction,
    /// Revisions purged
    Purge,

    // Change feed
    /// Change feed reader started
    FeedStart,
    /// Change feed request issued
    FeedRequest,
    /// Change feed entry rejected as unparseable
    FeedBadEntry,
    /// Change feed waiting before retry
    FeedBackoff,
    /// Change feed reader stopped
    FeedStopped,

    // Multipart
    /// MIME part started
    MultipartPartStart,
    /// MIME part finished
    MultipartPartComplete,

    // Ingest
    /// Change already present locally
    IngestSkipped,
    /// Revision fetched and inserted
    IngestAccepted,
    /// Revision could not be fetched or inserted
    IngestFailed,

    // Puller
    /// Pull session
    Pull,
    /// Checkpoint persisted
    CheckpointSaved,

    // Configuration
    /// Configuration loaded
    ConfigLoaded,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::StoreOpened => "STORE_OPENED",
            Event::StoreClosed => "STORE_CLOSED",

            Event::TransactionCommit => "TRANSACTION_COMMIT",
            Event::TransactionRollback => "TRANSACTION_ROLLBACK",

            Event::RevisionPut => "REVISION_PUT",
            Event::RevisionForceInserted => "REVISION_FORCE_INSERTED",
            Event::RevisionRejected => "REVISION_REJECTED",
            Event::RevisionInternalError => "REVISION_INTERNAL_ERROR",

            Event::Compaction => "COMPACTION",
            Event::Purge => "PURGE",

            Event::FeedStart => "FEED_START",
            Event::FeedRequest => "FEED_REQUEST",
            Event::FeedBadEntry => "FEED_BAD_ENTRY",
            Event::FeedBackoff => "FEED_BACKOFF",
            Event::FeedStopped => "FEED_STOPPED",

            Event::MultipartPartStart => "MULTIPART_PART_START",
            Event::MultipartPartComplete => "MULTIPART_PART_COMPLETE",

            Event::IngestSkipped => "INGEST_SKIPPED",
            Event::IngestAccepted => "INGEST_ACCEPTED",
            Event::IngestFailed => "INGEST_FAILED",

            Event::Pull => "PULL",
            Event::CheckpointSaved => "CHECKPOINT_SAVED",

            Event::ConfigLoaded => "CONFIG_LOADED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::RevisionInternalError)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
