//! Pull checkpoints
//!
//! The last sequence token a pull fully processed is kept in a local
//! (non-replicated) document. The document id is derived from the remote
//! URL and the feed filter, so a differently filtered pull of the same
//! remote starts from scratch.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use url::Url;

use super::change_entry::sequence_token;
use super::config::ReplicationConfig;
use super::errors::ReplicationResult;
use crate::observability::{Event, Logger};
use crate::revision::Properties;
use crate::store::DocumentStore;

/// Checkpoint for one remote and filter.
pub struct Checkpoint {
    store: Arc<dyn DocumentStore>,
    doc_id: String,
}

impl Checkpoint {
    /// `remote` must already be stripped of credentials.
    pub fn new(store: Arc<dyn DocumentStore>, remote: &Url, config: &ReplicationConfig) -> Self {
        Self {
            store,
            doc_id: checkpoint_id(remote, config),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// The saved sequence token, if any.
    pub fn load(&self) -> Option<Value> {
        self.store
            .get_local_document(&self.doc_id)
            .and_then(|doc| doc.body.get("last_seq").cloned())
            .filter(|seq| !seq.is_null())
    }

    /// Persist `seq` as processed.
    pub fn save(&self, seq: &Value) -> ReplicationResult<()> {
        let previous = self.store.get_local_document(&self.doc_id).map(|doc| doc.rev_id);
        let mut body = Properties::new();
        body.insert("last_seq".into(), seq.clone());
        body.insert("saved_at".into(), Value::String(Utc::now().to_rfc3339()));

        let rev_id = self
            .store
            .put_local_document(&self.doc_id, body, previous.as_ref(), true)?;
        Logger::trace(
            Event::CheckpointSaved.as_str(),
            &[
                ("doc_id", &self.doc_id),
                ("rev_id", rev_id.as_str()),
                ("last_seq", &sequence_token(seq)),
            ],
        );
        Ok(())
    }
}

/// `checkpoint/<sha256 hex>` over the remote and feed selection.
pub fn checkpoint_id(remote: &Url, config: &ReplicationConfig) -> String {
    let key = json!({
        "remote": remote.as_str(),
        "filter": config.filter,
        "filter_params": config.filter_params,
        "doc_ids": config.doc_ids,
    });
    let digest = Sha256::digest(key.to_string().as_bytes());
    let mut id = String::with_capacity(11 + digest.len() * 2);
    id.push_str("checkpoint/");
    for byte in digest {
        let _ = write!(id, "{:02x}", byte);
    }
    id
}
