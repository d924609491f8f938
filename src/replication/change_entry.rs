//! One entry of a remote change feed
//!
//! Wire shape: `{"seq": <token>, "id": <docId>, "changes": [{"rev": <revId>}], "deleted": <bool>}`.
//! The sequence token is opaque; it is kept as raw JSON so numeric and
//! string tokens both survive a round trip to the `since` parameter.

use serde_json::Value;

use super::errors::{ReplicationError, ReplicationResult};
use crate::revision::RevisionId;

/// A parsed change feed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    seq: Value,
    id: String,
    revisions: Vec<RevisionId>,
    deleted: bool,
}

impl ChangeEntry {
    pub fn new(seq: Value, id: impl Into<String>, revisions: Vec<RevisionId>, deleted: bool) -> Self {
        Self {
            seq,
            id: id.into(),
            revisions,
            deleted,
        }
    }

    /// Decode a wire entry. `seq` must be present and non-null and `id`
    /// must be a string; `changes` entries without a string `rev` are
    /// skipped.
    pub fn from_value(value: &Value) -> ReplicationResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| ReplicationError::malformed("change entry is not an object"))?;

        let seq = match object.get("seq") {
            Some(Value::Null) | None => {
                return Err(ReplicationError::malformed("change entry has no seq"))
            }
            Some(seq) => seq.clone(),
        };

        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ReplicationError::malformed("change entry has no id"))?;

        let revisions = object
            .get("changes")
            .and_then(Value::as_array)
            .map(|changes| {
                changes
                    .iter()
                    .filter_map(|change| change.get("rev").and_then(Value::as_str))
                    .map(RevisionId::from)
                    .collect()
            })
            .unwrap_or_default();

        let deleted = object.get("deleted").and_then(Value::as_bool).unwrap_or(false);

        Ok(Self::new(seq, id, revisions, deleted))
    }

    /// The raw sequence token.
    pub fn seq(&self) -> &Value {
        &self.seq
    }

    /// The sequence token as sent in a `since` parameter: strings
    /// verbatim, anything else as compact JSON.
    pub fn sequence_token(&self) -> String {
        sequence_token(&self.seq)
    }

    pub fn doc_id(&self) -> &str {
        &self.id
    }

    /// Every revision the entry advertises.
    pub fn revisions(&self) -> &[RevisionId] {
        &self.revisions
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Render a sequence token for a query string.
pub fn sequence_token(seq: &Value) -> String {
    match seq {
        Value::String(token) => token.clone(),
        other => other.to_string(),
    }
}
