//! Transaction state for the in-memory store
//!
//! A transaction mutates the committed state in place. Before the first
//! change to any key, its previous value is saved in a [`Journal`]; a
//! rollback puts every saved value back. Only the outermost transaction
//! commits or rolls back, and a failure at any depth dooms it.
//!
//! Threads other than the owner never observe in-progress state: they wait
//! for the owner to finish before reading.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;
use std::thread::ThreadId;

use url::Url;

use super::errors::{StoreError, StoreResult};
use super::notify::DocumentChange;
use super::sequence::SequenceAuthority;
use super::tree::{RevNode, RevTree};
use super::LocalDocument;
use crate::revision::{Properties, RevisionId};

/// Everything the store holds.
#[derive(Debug, Default)]
pub struct StoreState {
    pub docs: HashMap<String, Arc<RevTree>>,
    /// Change log: sequence -> (doc id, rev id).
    pub by_sequence: BTreeMap<u64, (String, RevisionId)>,
    pub local_docs: HashMap<String, LocalDocument>,
    pub info: HashMap<String, String>,
    pub last_sequence: u64,
}

/// Previous values of everything touched by the open transaction.
#[derive(Debug, Default)]
pub struct Journal {
    docs: HashMap<String, Option<Arc<RevTree>>>,
    sequences: HashMap<u64, Option<(String, RevisionId)>>,
    local_docs: HashMap<String, Option<LocalDocument>>,
    info: HashMap<String, Option<String>>,
    last_sequence: Option<u64>,
}

impl Journal {
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
            && self.sequences.is_empty()
            && self.local_docs.is_empty()
            && self.info.is_empty()
            && self.last_sequence.is_none()
    }

    /// Restore `state` to how it was before the transaction.
    pub fn rollback(self, state: &mut StoreState) {
        for (doc_id, previous) in self.docs {
            match previous {
                Some(tree) => state.docs.insert(doc_id, tree),
                None => state.docs.remove(&doc_id),
            };
        }
        for (sequence, previous) in self.sequences {
            match previous {
                Some(entry) => state.by_sequence.insert(sequence, entry),
                None => state.by_sequence.remove(&sequence),
            };
        }
        for (doc_id, previous) in self.local_docs {
            match previous {
                Some(doc) => state.local_docs.insert(doc_id, doc),
                None => state.local_docs.remove(&doc_id),
            };
        }
        for (key, previous) in self.info {
            match previous {
                Some(value) => state.info.insert(key, value),
                None => state.info.remove(&key),
            };
        }
        if let Some(last_sequence) = self.last_sequence {
            state.last_sequence = last_sequence;
        }
    }
}

/// Ownership and bookkeeping of the single open transaction.
#[derive(Debug, Default)]
pub struct TxSlot {
    pub owner: Option<ThreadId>,
    pub depth: usize,
    pub doomed: bool,
    pub journal: Journal,
    pub pending: Vec<DocumentChange>,
}

impl TxSlot {
    pub fn is_held_by_other(&self, me: ThreadId) -> bool {
        self.owner.is_some_and(|owner| owner != me)
    }

    /// Reset after the outermost transaction ends, returning its journal
    /// and pending notifications.
    pub fn release(&mut self) -> (Journal, Vec<DocumentChange>) {
        self.owner = None;
        self.depth = 0;
        self.doomed = false;
        (mem::take(&mut self.journal), mem::take(&mut self.pending))
    }
}

/// Journaled write access to the store state.
pub struct TxWriter<'a> {
    pub state: &'a mut StoreState,
    pub journal: &'a mut Journal,
    pub pending: &'a mut Vec<DocumentChange>,
    pub sequences: &'a SequenceAuthority,
}

impl<'a> TxWriter<'a> {
    pub fn tree(&self, doc_id: &str) -> Option<&RevTree> {
        self.state.docs.get(doc_id).map(Arc::as_ref)
    }

    /// Mutable tree for `doc_id`, created empty if absent.
    pub fn tree_mut(&mut self, doc_id: &str) -> &mut RevTree {
        if !self.journal.docs.contains_key(doc_id) {
            let previous = self.state.docs.get(doc_id).cloned();
            self.journal.docs.insert(doc_id.to_string(), previous);
        }
        let tree = self.state.docs.entry(doc_id.to_string()).or_default();
        Arc::make_mut(tree)
    }

    /// Drop a document whose tree became empty.
    pub fn remove_if_empty(&mut self, doc_id: &str) {
        if self.tree(doc_id).is_some_and(RevTree::is_empty) {
            if !self.journal.docs.contains_key(doc_id) {
                let previous = self.state.docs.get(doc_id).cloned();
                self.journal.docs.insert(doc_id.to_string(), previous);
            }
            self.state.docs.remove(doc_id);
        }
    }

    fn index_sequence(&mut self, sequence: u64, doc_id: &str, rev_id: &RevisionId) {
        let previous = self.state.by_sequence.get(&sequence).cloned();
        self.journal.sequences.entry(sequence).or_insert(previous);
        self.state
            .by_sequence
            .insert(sequence, (doc_id.to_string(), rev_id.clone()));
        if self.journal.last_sequence.is_none() {
            self.journal.last_sequence = Some(self.state.last_sequence);
        }
        self.state.last_sequence = self.state.last_sequence.max(sequence);
    }

    /// Remove change-log entries of removed revisions.
    pub fn unindex(&mut self, removed: &[(RevisionId, u64)]) {
        for (_, sequence) in removed {
            if *sequence == 0 {
                continue;
            }
            let previous = self.state.by_sequence.remove(sequence);
            self.journal.sequences.entry(*sequence).or_insert(previous);
        }
    }

    /// Insert a stored revision, assign it the next sequence and queue its
    /// change notification.
    pub fn store_revision(
        &mut self,
        doc_id: &str,
        rev_id: &RevisionId,
        parent: Option<RevisionId>,
        deleted: bool,
        body: Properties,
        source: Option<&Url>,
    ) -> StoreResult<u64> {
        if let Some(parent_id) = &parent {
            if !self.tree(doc_id).is_some_and(|tree| tree.contains(parent_id)) {
                return Err(StoreError::Internal(format!(
                    "parent {} of {} missing from '{}'",
                    parent_id, rev_id, doc_id
                )));
            }
        }
        let previous_current = self.tree(doc_id).and_then(|t| t.current().cloned());
        let sequence = self.sequences.allocate();
        let node = RevNode::stored(parent, sequence, deleted, body);
        if !self.tree_mut(doc_id).insert(rev_id.clone(), node) {
            return Err(StoreError::Internal(format!(
                "revision {} of '{}' inserted twice",
                rev_id, doc_id
            )));
        }
        self.index_sequence(sequence, doc_id, rev_id);
        self.queue_change(doc_id, rev_id, deleted, sequence, previous_current, source);
        Ok(sequence)
    }

    /// Give a placeholder its body and a sequence.
    pub fn fill_placeholder(
        &mut self,
        doc_id: &str,
        rev_id: &RevisionId,
        deleted: bool,
        body: Properties,
        source: Option<&Url>,
    ) -> StoreResult<u64> {
        let previous_current = self.tree(doc_id).and_then(|t| t.current().cloned());
        let sequence = self.sequences.allocate();
        let Some(node) = self.tree_mut(doc_id).node_mut(rev_id) else {
            return Err(StoreError::Internal(format!(
                "placeholder {} of '{}' vanished",
                rev_id, doc_id
            )));
        };
        node.sequence = sequence;
        node.deleted = deleted;
        node.body = Some(body);
        node.missing = false;
        self.index_sequence(sequence, doc_id, rev_id);
        self.queue_change(doc_id, rev_id, deleted, sequence, previous_current, source);
        Ok(sequence)
    }

    /// Insert ancestors known only by id, oldest first. `chain` is newest
    /// first; the last element's parent is `root_parent`.
    pub fn insert_placeholders(
        &mut self,
        doc_id: &str,
        chain: &[RevisionId],
        root_parent: Option<RevisionId>,
    ) -> StoreResult<()> {
        let tree = self.tree_mut(doc_id);
        for (index, rev_id) in chain.iter().enumerate().rev() {
            let parent = match chain.get(index + 1) {
                Some(older) => Some(older.clone()),
                None => root_parent.clone(),
            };
            if !tree.insert(rev_id.clone(), RevNode::placeholder(parent)) {
                return Err(StoreError::Internal(format!(
                    "placeholder {} of '{}' already present",
                    rev_id, doc_id
                )));
            }
        }
        Ok(())
    }

    fn queue_change(
        &mut self,
        doc_id: &str,
        rev_id: &RevisionId,
        deleted: bool,
        sequence: u64,
        previous_current: Option<RevisionId>,
        source: Option<&Url>,
    ) {
        let (current, in_conflict) = match self.tree(doc_id) {
            Some(tree) => (tree.current().cloned(), tree.in_conflict()),
            None => (None, false),
        };
        let winning_revision_changed =
            current != previous_current || current.as_ref() == Some(rev_id);
        self.pending.push(DocumentChange {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.clone(),
            deleted,
            sequence,
            winning_revision_changed,
            in_conflict,
            source: source.cloned(),
        });
    }

    pub fn put_local(&mut self, doc: LocalDocument) {
        let previous = self.state.local_docs.get(&doc.id).cloned();
        self.journal
            .local_docs
            .entry(doc.id.clone())
            .or_insert(previous);
        self.state.local_docs.insert(doc.id.clone(), doc);
    }

    pub fn put_info(&mut self, key: &str, value: &str) {
        let previous = self.state.info.get(key).cloned();
        self.journal.info.entry(key.to_string()).or_insert(previous);
        self.state.info.insert(key.to_string(), value.to_string());
    }
}
