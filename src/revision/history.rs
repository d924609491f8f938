//! Revision history encoding
//!
//! Remote documents advertise their ancestry as
//! `"_revisions": {"start": <generation>, "ids": [<hash>, ...]}`, newest
//! first, each id one generation below the previous.

use serde_json::{json, Value};

use super::{Properties, RevisionId};

/// Parse `_revisions` from a document into full revision ids, newest first.
///
/// Returns an empty list when the structure is absent or unusable.
pub fn parse_revision_history(document: &Properties) -> Vec<RevisionId> {
    let Some(revisions) = document.get("_revisions").and_then(Value::as_object) else {
        return Vec::new();
    };
    let Some(ids) = revisions.get("ids").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Some(start) = revisions.get("start").and_then(Value::as_u64) else {
        return Vec::new();
    };

    let mut history = Vec::with_capacity(ids.len());
    for (offset, id) in ids.iter().enumerate() {
        let Some(suffix) = id.as_str() else {
            return Vec::new();
        };
        let generation = start.saturating_sub(offset as u64);
        if generation == 0 {
            break;
        }
        history.push(RevisionId::from_parts(generation, suffix));
    }
    history
}

/// Encode a newest-first history as `{"start", "ids"}`.
///
/// If the ids are not a run of consecutive well-formed generations, the
/// full ids are emitted without `start`.
pub fn encode_revision_history(history: &[RevisionId]) -> Value {
    let mut suffixes = Vec::with_capacity(history.len());
    let mut start = None;
    let mut previous = 0u64;
    for rev in history {
        match rev.parse() {
            Some((generation, suffix)) if start.is_none() || generation + 1 == previous => {
                if start.is_none() {
                    start = Some(generation);
                }
                previous = generation;
                suffixes.push(suffix.to_string());
            }
            _ => {
                let ids: Vec<&str> = history.iter().map(RevisionId::as_str).collect();
                return json!({ "ids": ids });
            }
        }
    }
    match start {
        Some(start) => json!({ "start": start, "ids": suffixes }),
        None => json!({ "ids": [] }),
    }
}
