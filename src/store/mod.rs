//! Document store
//!
//! Owns every revision of every document as a per-document revision tree.
//!
//! - Local writes (`put_revision`) must extend a current leaf unless
//!   conflicts are explicitly allowed
//! - Replicated writes (`force_insert`) always add the incoming revision,
//!   filling unknown ancestry with placeholders
//! - Both paths consult a caller-supplied [`ValidationHook`]
//! - Every stored revision gets a database-wide sequence number
//! - Multi-step mutations are all-or-nothing inside `run_in_transaction`
//!
//! Callers receive copies of revisions, never references into a tree.
//! Absent documents and revisions are `None` or empty, never errors.

mod blobs;
mod config;
mod errors;
mod memory;
mod notify;
mod sequence;
mod transaction;
mod tree;
mod validation;

pub use blobs::{blob_digest, md5_digest, BlobReceipt, BlobStore, BlobWriter};
pub use config::{open_store, StoreBackend, StoreConfig};
pub use errors::{Severity, StoreError, StoreResult, ValidationError};
pub use memory::MemoryStore;
pub use notify::{ChangeObserver, DocumentChange};
pub use sequence::SequenceAuthority;
pub use validation::{AcceptAll, RejectDeletions, ValidationHook};

use serde::Serialize;
use url::Url;

use crate::revision::{Properties, Revision, RevisionId};

/// Predicate applied to `changes_since` results.
pub type RevisionFilter = dyn Fn(&Revision) -> bool + Send + Sync;

/// What a transaction body asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Commit,
    Rollback,
}

/// A non-replicated document, used for checkpoints and similar metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDocument {
    pub id: String,
    /// `<n>-local`
    pub rev_id: RevisionId,
    pub body: Properties,
}

/// Result of a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub revisions_pruned: usize,
    pub bodies_dropped: usize,
}

/// The revision-tree store contract.
pub trait DocumentStore: Send + Sync {
    /// A revision of `doc_id`; the current one when `rev_id` is `None`.
    ///
    /// A deleted current revision is returned with `is_deleted() == true`.
    fn get(&self, doc_id: &str, rev_id: Option<&RevisionId>, with_body: bool) -> Option<Revision>;

    /// Local write. Generates a document id when `doc_id` is `None`.
    ///
    /// `parent` must name a current leaf unless `allow_conflict`. With no
    /// parent the document must not exist, or its current revision must
    /// be a tombstone, which then becomes the parent.
    fn put_revision(
        &self,
        doc_id: Option<&str>,
        parent: Option<&RevisionId>,
        properties: Properties,
        deleting: bool,
        allow_conflict: bool,
        validate: &dyn ValidationHook,
    ) -> StoreResult<Revision>;

    /// Replicated write. `history` is the revision's own id followed by its
    /// ancestors, newest first; an empty history means no known ancestry.
    ///
    /// Already-present revisions are a no-op. Never fails because another
    /// leaf exists.
    fn force_insert(
        &self,
        revision: Revision,
        history: &[RevisionId],
        validate: &dyn ValidationHook,
        source: Option<&Url>,
    ) -> StoreResult<()>;

    /// Current leaves only, or every retained revision, ordered by
    /// sequence. Bodies are not loaded.
    fn all_revisions(&self, doc_id: &str, only_current: bool) -> Vec<Revision>;

    /// Stored revisions with a sequence greater than `sequence`, ascending,
    /// with bodies.
    fn changes_since(&self, sequence: u64, filter: Option<&RevisionFilter>) -> Vec<Revision>;

    /// Run `body` atomically. Nested calls join the outer transaction; only
    /// the outermost one commits. A nested rollback or a failed store
    /// operation dooms the whole transaction.
    ///
    /// Returns true if this body's work will be (or was) committed.
    fn run_in_transaction(&self, body: &mut dyn FnMut() -> TransactionOutcome) -> bool;

    /// `rev_id` and its retained ancestors, newest first, without bodies.
    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId) -> Vec<Revision>;

    /// The parent of `revision`, with body if held.
    fn parent_revision(&self, revision: &Revision) -> Option<Revision>;

    /// The `(doc id, rev id)` pairs not present locally, in input order.
    fn find_missing_revisions(&self, revisions: &[(String, RevisionId)]) -> Vec<(String, RevisionId)>;

    /// The greatest of `candidates` present in the document's tree.
    fn find_common_ancestor(&self, doc_id: &str, candidates: &[RevisionId]) -> Option<RevisionId>;

    /// Revisions of lower generation than `rev_id` that still hold a body,
    /// newest generation first.
    fn possible_ancestors(&self, doc_id: &str, rev_id: &RevisionId, limit: usize) -> Vec<RevisionId>;

    /// Remove the named leaves and their unshared ancestors; `"*"` removes
    /// the whole document. Returns the ids removed.
    fn purge_revisions(&self, doc_id: &str, rev_ids: &[RevisionId]) -> StoreResult<Vec<RevisionId>>;

    /// Drop non-leaf bodies and prune ancestry deeper than the configured
    /// depth.
    fn compact(&self) -> StoreResult<CompactionReport>;

    /// Documents whose current revision is not deleted.
    fn document_count(&self) -> usize;

    /// Every document id with a retained tree, sorted.
    fn document_ids(&self) -> Vec<String>;

    /// Highest committed sequence.
    fn last_sequence(&self) -> u64;

    /// True if the calling thread has an open transaction.
    fn in_transaction(&self) -> bool;

    fn get_local_document(&self, doc_id: &str) -> Option<LocalDocument>;

    /// Write a local document. With `obey_mvcc`, `prev_rev` must match the
    /// stored revision (or be `None` for a new document).
    fn put_local_document(
        &self,
        doc_id: &str,
        properties: Properties,
        prev_rev: Option<&RevisionId>,
        obey_mvcc: bool,
    ) -> StoreResult<RevisionId>;

    fn set_info(&self, key: &str, value: &str) -> StoreResult<()>;

    fn get_info(&self, key: &str) -> Option<String>;
}
