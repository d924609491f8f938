//! Change notifications
//!
//! Every committed revision produces one [`DocumentChange`]. Changes are
//! delivered to the observer given to the store factory, after the
//! outermost transaction commits and in commit order. Rolled-back work
//! produces nothing.

use url::Url;

use crate::revision::RevisionId;

/// A committed revision, as seen by the view-indexing collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub doc_id: String,
    pub rev_id: RevisionId,
    pub deleted: bool,
    pub sequence: u64,
    /// True if the document's current revision changed.
    pub winning_revision_changed: bool,
    /// True if the document has more than one leaf after this change.
    pub in_conflict: bool,
    /// Remote the revision was pulled from, `None` for local writes.
    pub source: Option<Url>,
}

/// Receives change notifications from the store.
pub trait ChangeObserver: Send + Sync {
    fn on_document_changed(&self, change: &DocumentChange);
}

impl<F> ChangeObserver for F
where
    F: Fn(&DocumentChange) + Send + Sync,
{
    fn on_document_changed(&self, change: &DocumentChange) {
        self(change)
    }
}
