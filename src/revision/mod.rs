//! Revision domain types
//!
//! - `RevisionId` - comparable `(generation, hash)` identity
//! - `Revision` - immutable document snapshot
//! - `_revisions` history encoding used on the wire

mod history;
mod rev_id;
#[allow(clippy::module_inception)]
mod revision;

pub use history::{encode_revision_history, parse_revision_history};
pub use rev_id::{compare_rev_ids, RevisionId};
pub use revision::{strip_special_keys, Revision, SPECIAL_KEYS};

/// A document body: string-keyed JSON values.
pub type Properties = serde_json::Map<String, serde_json::Value>;
