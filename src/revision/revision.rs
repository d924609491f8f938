//! Revision - Immutable snapshot of a document at one point in its history
//!
//! - Created by a local write or by a replicated force-insert
//! - Never changes after creation; an update creates a child revision
//! - `sequence` is assigned by the store (0 until stored)
//! - A revision without a body is either not loaded or `missing`
//!   (a placeholder ancestor or a compacted revision)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Properties, RevisionId};

/// Top-level keys that carry revision metadata rather than document content.
pub const SPECIAL_KEYS: &[&str] = &[
    "_id",
    "_rev",
    "_deleted",
    "_revisions",
    "_revs_info",
    "_conflicts",
    "_deleted_conflicts",
    "_local_seq",
];

/// Remove revision metadata keys from a document body, keeping
/// `_attachments` and `_removed`.
pub fn strip_special_keys(properties: &mut Properties) {
    for key in SPECIAL_KEYS {
        properties.remove(*key);
    }
}

/// One immutable version of a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    doc_id: String,
    rev_id: RevisionId,
    deleted: bool,
    sequence: u64,
    body: Option<Properties>,
    missing: bool,
}

impl Revision {
    /// Create a revision with no body and no sequence.
    pub fn new(doc_id: impl Into<String>, rev_id: RevisionId, deleted: bool) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted,
            sequence: 0,
            body: None,
            missing: false,
        }
    }

    /// Attach a body. Metadata keys are stripped.
    pub fn with_body(mut self, mut body: Properties) -> Self {
        strip_special_keys(&mut body);
        self.body = Some(body);
        self
    }

    /// Build a revision from a CouchDB-style document (`_id`, `_rev`,
    /// optional `_deleted`). Returns `None` if `_id` or `_rev` is absent.
    pub fn from_document(document: Properties) -> Option<Self> {
        let doc_id = document.get("_id")?.as_str()?.to_string();
        let rev_id = RevisionId::new(document.get("_rev")?.as_str()?);
        let deleted = document
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self::new(doc_id, rev_id, deleted).with_body(document))
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub(crate) fn with_missing(mut self, missing: bool) -> Self {
        self.missing = missing;
        self
    }

    pub(crate) fn without_body(mut self) -> Self {
        self.body = None;
        self
    }

    /// Returns the document id.
    #[inline]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Returns the revision id.
    #[inline]
    pub fn rev_id(&self) -> &RevisionId {
        &self.rev_id
    }

    /// Returns true if this revision is a tombstone.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Store-assigned sequence, 0 if not stored yet.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The document body, if loaded and available.
    #[inline]
    pub fn body(&self) -> Option<&Properties> {
        self.body.as_ref()
    }

    /// Consume the revision, returning its body.
    pub fn into_body(self) -> Option<Properties> {
        self.body
    }

    /// True if the store holds no body for this revision.
    #[inline]
    pub fn is_missing(&self) -> bool {
        self.missing
    }

    /// Generation of the revision id.
    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }

    /// The `_attachments` metadata object, if any.
    pub fn attachments(&self) -> Option<&Properties> {
        self.body
            .as_ref()
            .and_then(|b| b.get("_attachments"))
            .and_then(Value::as_object)
    }

    /// The body with `_id`, `_rev` and (if deleted) `_deleted` added.
    pub fn to_document(&self) -> Properties {
        let mut document = self.body.clone().unwrap_or_default();
        document.insert("_id".into(), Value::String(self.doc_id.clone()));
        document.insert("_rev".into(), Value::String(self.rev_id.to_string()));
        if self.deleted {
            document.insert("_deleted".into(), Value::Bool(true));
        }
        document
    }
}
