//! In-memory document store
//!
//! Concurrency model:
//! - One transaction is open at a time, owned by one thread
//! - The owning thread may nest transactions and read its own writes
//! - Other threads wait for the transaction to finish before reading or
//!   starting their own; they never see intermediate state
//! - Readers run concurrently with each other when no transaction is open
//!
//! Validation hooks run with no store lock held. Change observers run
//! after the outermost commit, in commit order, with no lock held.
//!
//! Lock order is always `state` before `slot`.

use std::collections::{HashSet, VecDeque};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    TryLockError,
};
use std::thread::{self, ThreadId};

use url::Url;
use uuid::Uuid;

use super::config::StoreConfig;
use super::errors::{StoreError, StoreResult, ValidationError};
use super::notify::{ChangeObserver, DocumentChange};
use super::sequence::SequenceAuthority;
use super::transaction::{StoreState, TxSlot, TxWriter};
use super::validation::ValidationHook;
use super::{CompactionReport, DocumentStore, LocalDocument, RevisionFilter, TransactionOutcome};
use crate::observability::{log_event, mask_credentials, Event, Logger, ObservationScope};
use crate::revision::{strip_special_keys, Properties, Revision, RevisionId};

/// Non-persistent [`DocumentStore`].
pub struct MemoryStore {
    config: StoreConfig,
    state: RwLock<StoreState>,
    slot: Mutex<TxSlot>,
    slot_free: Condvar,
    sequences: SequenceAuthority,
    observer: Option<Arc<dyn ChangeObserver>>,
    outbox: Mutex<VecDeque<DocumentChange>>,
    delivering: Mutex<()>,
}

/// Ends the transaction it was created for; a guard dropped without
/// `finish` (for example by a panicking body) rolls back.
struct TxGuard<'a> {
    store: &'a MemoryStore,
    finished: bool,
}

impl TxGuard<'_> {
    fn finish(mut self, success: bool) -> bool {
        self.finished = true;
        self.store.end(success)
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.end(false);
        }
    }
}

/// What `put_revision` will insert once validated.
struct PreparedPut {
    revision: Revision,
    parent: Option<RevisionId>,
    parent_revision: Option<Revision>,
}

/// What `force_insert` will do once validated.
enum ForcePlan {
    /// The revision is already stored.
    Present,
    /// The revision exists only as a placeholder.
    Fill { parent_revision: Option<Revision> },
    /// `history[1..known]` are unknown ancestors; `history[known]`, if
    /// any, is already in the tree.
    Insert {
        known: usize,
        parent_revision: Option<Revision>,
    },
}

impl MemoryStore {
    pub fn new(config: StoreConfig, observer: Option<Arc<dyn ChangeObserver>>) -> Self {
        Self {
            config,
            state: RwLock::new(StoreState::default()),
            slot: Mutex::new(TxSlot::default()),
            slot_free: Condvar::new(),
            sequences: SequenceAuthority::new(),
            observer,
            outbox: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ========================================================================
    // Locking and transactions
    // ========================================================================

    fn lock_slot(&self) -> MutexGuard<'_, TxSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed state, or the calling thread's own in-progress state.
    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        let me = thread::current().id();
        loop {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if !self.lock_slot().is_held_by_other(me) {
                return state;
            }
            drop(state);
            self.wait_for_slot(me);
        }
    }

    fn wait_for_slot(&self, me: ThreadId) {
        let slot = self.lock_slot();
        drop(
            self.slot_free
                .wait_while(slot, |slot| slot.is_held_by_other(me))
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    fn begin(&self) -> TxGuard<'_> {
        let me = thread::current().id();
        let mut slot = self.lock_slot();
        loop {
            match slot.owner {
                None => {
                    slot.owner = Some(me);
                    slot.depth = 1;
                    slot.doomed = false;
                    break;
                }
                Some(owner) if owner == me => {
                    slot.depth += 1;
                    break;
                }
                Some(_) => {
                    slot = self
                        .slot_free
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        TxGuard {
            store: self,
            finished: false,
        }
    }

    fn end(&self, success: bool) -> bool {
        let mut state = self.write_state();
        let mut slot = self.lock_slot();
        if !success {
            slot.doomed = true;
        }
        slot.depth = slot.depth.saturating_sub(1);
        if slot.depth > 0 {
            return success && !slot.doomed;
        }

        let committed = !slot.doomed;
        let (journal, pending) = slot.release();
        let touched = !journal.is_empty();
        if committed {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            if self.observer.is_some() {
                outbox.extend(pending);
            }
        } else {
            journal.rollback(&mut *state);
        }
        drop(slot);
        drop(state);
        self.slot_free.notify_all();

        if touched {
            let event = if committed {
                Event::TransactionCommit
            } else {
                Event::TransactionRollback
            };
            Logger::trace(event.as_str(), &[]);
        }
        if committed {
            self.deliver();
        }
        committed
    }

    /// Run `op` with journaled write access. The caller must own the
    /// transaction.
    fn apply<T>(&self, op: impl FnOnce(&mut TxWriter<'_>) -> T) -> T {
        let mut state = self.write_state();
        let mut slot = self.lock_slot();
        let slot = &mut *slot;
        let mut writer = TxWriter {
            state: &mut *state,
            journal: &mut slot.journal,
            pending: &mut slot.pending,
            sequences: &self.sequences,
        };
        op(&mut writer)
    }

    /// Hand queued notifications to the observer. Whoever holds the
    /// delivery turn drains the queue, so a commit made from inside an
    /// observer is delivered by the outer loop.
    fn deliver(&self) {
        let Some(observer) = &self.observer else {
            return;
        };
        loop {
            {
                let _turn = match self.delivering.try_lock() {
                    Ok(turn) => turn,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                    Err(TryLockError::WouldBlock) => return,
                };
                loop {
                    let next = self
                        .outbox
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    match next {
                        Some(change) => observer.on_document_changed(&change),
                        None => break,
                    }
                }
            }
            let empty = self
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty();
            if empty {
                return;
            }
        }
    }

    fn auto_compact(&self, tx: &mut TxWriter<'_>, doc_id: &str) {
        if !self.config.auto_compact {
            return;
        }
        let depth = self.config.max_rev_tree_depth;
        let needs_pruning = tx.tree(doc_id).is_some_and(|tree| {
            tree.iter()
                .map(|(id, _)| id.generation())
                .min()
                .is_some_and(|oldest| tree.max_generation() - oldest >= depth)
        });
        if needs_pruning {
            let removed = tx.tree_mut(doc_id).prune(depth);
            tx.unindex(&removed);
        }
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    fn prepare_put(
        &self,
        doc_id: &str,
        parent: Option<&RevisionId>,
        body: Properties,
        deleting: bool,
        allow_conflict: bool,
    ) -> StoreResult<PreparedPut> {
        let state = self.read_state();
        let tree = state
            .docs
            .get(doc_id)
            .map(Arc::as_ref)
            .filter(|tree| !tree.is_empty());

        let effective_parent = match (parent, tree) {
            (Some(parent), Some(tree)) if tree.contains(parent) => {
                if !allow_conflict && !tree.is_leaf(parent) {
                    return Err(StoreError::conflict(doc_id));
                }
                Some(parent.clone())
            }
            (Some(_), Some(_)) if !allow_conflict => return Err(StoreError::conflict(doc_id)),
            (Some(parent), _) => {
                return Err(StoreError::NotFound(format!(
                    "revision {} of '{}'",
                    parent, doc_id
                )))
            }
            (None, Some(tree)) => {
                if tree.is_deleted() {
                    tree.current().cloned()
                } else if allow_conflict {
                    None
                } else {
                    return Err(StoreError::conflict(doc_id));
                }
            }
            (None, None) if deleting => {
                return Err(StoreError::NotFound(format!("document '{}'", doc_id)))
            }
            (None, None) => None,
        };

        let rev_id = RevisionId::generate(effective_parent.as_ref(), Some(&body), deleting)
            .ok_or_else(|| {
                StoreError::Malformed(format!(
                    "cannot derive a revision id from parent {:?}",
                    effective_parent.as_ref().map(RevisionId::as_str)
                ))
            })?;
        if tree.is_some_and(|tree| tree.contains(&rev_id)) {
            return Err(StoreError::conflict(doc_id));
        }

        let parent_revision = match (&effective_parent, tree) {
            (Some(parent), Some(tree)) => tree.revision(doc_id, parent, true),
            _ => None,
        };
        Ok(PreparedPut {
            revision: Revision::new(doc_id, rev_id, deleting).with_body(body),
            parent: effective_parent,
            parent_revision,
        })
    }

    // ========================================================================
    // Replicated writes
    // ========================================================================

    fn prepare_force(&self, doc_id: &str, history: &[RevisionId]) -> ForcePlan {
        let state = self.read_state();
        let Some(tree) = state.docs.get(doc_id) else {
            return ForcePlan::Insert {
                known: history.len(),
                parent_revision: None,
            };
        };
        if let Some(node) = tree.node(&history[0]) {
            if node.sequence != 0 {
                return ForcePlan::Present;
            }
            let parent_revision = node
                .parent
                .as_ref()
                .and_then(|parent| tree.revision(doc_id, parent, true));
            return ForcePlan::Fill { parent_revision };
        }
        let known = history
            .iter()
            .position(|rev_id| tree.contains(rev_id))
            .unwrap_or(history.len());
        let parent_revision = history
            .get(1)
            .and_then(|parent| tree.revision(doc_id, parent, true));
        ForcePlan::Insert {
            known,
            parent_revision,
        }
    }

    fn reject(&self, revision: &Revision, reason: ValidationError) -> StoreError {
        Logger::warn(
            Event::RevisionRejected.as_str(),
            &[
                ("doc_id", revision.doc_id()),
                ("rev_id", revision.rev_id().as_str()),
                ("reason", reason.reason()),
            ],
        );
        StoreError::rejected(revision.doc_id(), revision.rev_id().as_str(), reason)
    }

    fn report_internal(&self, err: &StoreError, doc_id: &str) {
        if err.is_fatal() {
            log_event(
                Event::RevisionInternalError,
                &[("doc_id", doc_id), ("error", &err.to_string())],
            );
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        log_event(
            Event::StoreClosed,
            &[("last_sequence", &self.sequences.highest().to_string())],
        );
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, doc_id: &str, rev_id: Option<&RevisionId>, with_body: bool) -> Option<Revision> {
        let state = self.read_state();
        let tree = state.docs.get(doc_id)?;
        let rev_id = match rev_id {
            Some(rev_id) => rev_id,
            None => tree.current()?,
        };
        tree.revision(doc_id, rev_id, with_body)
    }

    fn put_revision(
        &self,
        doc_id: Option<&str>,
        parent: Option<&RevisionId>,
        mut properties: Properties,
        deleting: bool,
        allow_conflict: bool,
        validate: &dyn ValidationHook,
    ) -> StoreResult<Revision> {
        let doc_id = match doc_id {
            Some("") => return Err(StoreError::Malformed("empty document id".to_string())),
            Some(id) => id.to_string(),
            None if parent.is_some() => {
                return Err(StoreError::Malformed(
                    "parent revision given without a document id".to_string(),
                ))
            }
            None => Uuid::new_v4().simple().to_string(),
        };
        if let Some(parent) = parent.filter(|id| !id.is_well_formed()) {
            return Err(StoreError::Malformed(format!("unparseable revision id '{}'", parent)));
        }
        strip_special_keys(&mut properties);

        let guard = self.begin();
        let prepared = match self.prepare_put(&doc_id, parent, properties, deleting, allow_conflict) {
            Ok(prepared) => prepared,
            Err(err) => {
                guard.finish(false);
                return Err(err);
            }
        };
        if let Err(reason) = validate.validate(&prepared.revision, prepared.parent_revision.as_ref()) {
            guard.finish(false);
            return Err(self.reject(&prepared.revision, reason));
        }

        let revision = prepared.revision;
        let body = revision.body().cloned().unwrap_or_default();
        let stored: StoreResult<u64> = self.apply(|tx| {
            let sequence = tx.store_revision(
                &doc_id,
                revision.rev_id(),
                prepared.parent,
                deleting,
                body,
                None,
            )?;
            self.auto_compact(tx, &doc_id);
            Ok(sequence)
        });
        match stored {
            Ok(sequence) => {
                guard.finish(true);
                Logger::info(
                    Event::RevisionPut.as_str(),
                    &[
                        ("doc_id", &doc_id),
                        ("rev_id", revision.rev_id().as_str()),
                        ("sequence", &sequence.to_string()),
                    ],
                );
                Ok(revision.with_sequence(sequence))
            }
            Err(err) => {
                guard.finish(false);
                self.report_internal(&err, &doc_id);
                Err(err)
            }
        }
    }

    fn force_insert(
        &self,
        revision: Revision,
        history: &[RevisionId],
        validate: &dyn ValidationHook,
        source: Option<&Url>,
    ) -> StoreResult<()> {
        let doc_id = revision.doc_id().to_string();
        if doc_id.is_empty() {
            return Err(StoreError::Malformed("empty document id".to_string()));
        }
        let history: Vec<RevisionId> = if history.is_empty() {
            vec![revision.rev_id().clone()]
        } else {
            history.to_vec()
        };
        if let Some(bad) = history.iter().find(|id| !id.is_well_formed()) {
            return Err(StoreError::Malformed(format!("unparseable revision id '{}'", bad)));
        }
        if history[0] != *revision.rev_id() {
            return Err(StoreError::Malformed(format!(
                "history of {} starts with {}",
                revision.rev_id(),
                history[0]
            )));
        }
        let distinct: HashSet<&RevisionId> = history.iter().collect();
        if distinct.len() != history.len() {
            return Err(StoreError::Malformed(format!(
                "history of {} repeats a revision",
                revision.rev_id()
            )));
        }

        let guard = self.begin();
        let plan = self.prepare_force(&doc_id, &history);
        let parent_revision = match &plan {
            ForcePlan::Present => {
                guard.finish(true);
                return Ok(());
            }
            ForcePlan::Fill { parent_revision } | ForcePlan::Insert { parent_revision, .. } => {
                parent_revision.as_ref()
            }
        };
        if let Err(reason) = validate.validate(&revision, parent_revision) {
            guard.finish(false);
            return Err(self.reject(&revision, reason));
        }

        let rev_id = revision.rev_id().clone();
        let deleted = revision.is_deleted();
        let body = revision.into_body().unwrap_or_default();
        let stored: StoreResult<u64> = self.apply(|tx| {
            let sequence = match plan {
                ForcePlan::Fill { .. } => tx.fill_placeholder(&doc_id, &rev_id, deleted, body, source)?,
                ForcePlan::Insert { known, .. } => {
                    if known > 1 {
                        tx.insert_placeholders(&doc_id, &history[1..known], history.get(known).cloned())?;
                    }
                    tx.store_revision(&doc_id, &rev_id, history.get(1).cloned(), deleted, body, source)?
                }
                ForcePlan::Present => 0,
            };
            self.auto_compact(tx, &doc_id);
            Ok(sequence)
        });
        match stored {
            Ok(sequence) => {
                guard.finish(true);
                let source = source.map(|url| mask_credentials(url.as_str())).unwrap_or_default();
                Logger::info(
                    Event::RevisionForceInserted.as_str(),
                    &[
                        ("doc_id", &doc_id),
                        ("rev_id", rev_id.as_str()),
                        ("sequence", &sequence.to_string()),
                        ("source", &source),
                    ],
                );
                Ok(())
            }
            Err(err) => {
                guard.finish(false);
                self.report_internal(&err, &doc_id);
                Err(err)
            }
        }
    }

    fn all_revisions(&self, doc_id: &str, only_current: bool) -> Vec<Revision> {
        let state = self.read_state();
        let Some(tree) = state.docs.get(doc_id) else {
            return Vec::new();
        };
        let ids: Vec<&RevisionId> = if only_current {
            tree.leaves()
        } else {
            tree.iter().map(|(id, _)| id).collect()
        };
        let mut revisions: Vec<Revision> = ids
            .into_iter()
            .filter_map(|id| tree.revision(doc_id, id, false))
            .collect();
        revisions.sort_by(|a, b| {
            a.sequence()
                .cmp(&b.sequence())
                .then_with(|| a.rev_id().as_str().cmp(b.rev_id().as_str()))
        });
        revisions
    }

    fn changes_since(&self, sequence: u64, filter: Option<&RevisionFilter>) -> Vec<Revision> {
        let state = self.read_state();
        let start = sequence.saturating_add(1);
        state
            .by_sequence
            .range(start..)
            .filter_map(|(_, (doc_id, rev_id))| {
                state.docs.get(doc_id)?.revision(doc_id, rev_id, true)
            })
            .filter(|revision| filter.map_or(true, |keep| keep(revision)))
            .collect()
    }

    fn run_in_transaction(&self, body: &mut dyn FnMut() -> TransactionOutcome) -> bool {
        let guard = self.begin();
        let outcome = body();
        guard.finish(outcome == TransactionOutcome::Commit)
    }

    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId) -> Vec<Revision> {
        let state = self.read_state();
        let Some(tree) = state.docs.get(doc_id) else {
            return Vec::new();
        };
        tree.ancestry(rev_id)
            .iter()
            .filter_map(|id| tree.revision(doc_id, id, false))
            .collect()
    }

    fn parent_revision(&self, revision: &Revision) -> Option<Revision> {
        let state = self.read_state();
        let tree = state.docs.get(revision.doc_id())?;
        let parent = tree.node(revision.rev_id())?.parent.as_ref()?;
        tree.revision(revision.doc_id(), parent, true)
    }

    fn find_missing_revisions(&self, revisions: &[(String, RevisionId)]) -> Vec<(String, RevisionId)> {
        let state = self.read_state();
        revisions
            .iter()
            .filter(|(doc_id, rev_id)| {
                !state
                    .docs
                    .get(doc_id)
                    .is_some_and(|tree| tree.contains(rev_id))
            })
            .cloned()
            .collect()
    }

    fn find_common_ancestor(&self, doc_id: &str, candidates: &[RevisionId]) -> Option<RevisionId> {
        let state = self.read_state();
        let tree = state.docs.get(doc_id)?;
        candidates
            .iter()
            .filter(|rev_id| tree.contains(rev_id))
            .max()
            .cloned()
    }

    fn possible_ancestors(&self, doc_id: &str, rev_id: &RevisionId, limit: usize) -> Vec<RevisionId> {
        let generation = rev_id.generation();
        let state = self.read_state();
        let Some(tree) = state.docs.get(doc_id) else {
            return Vec::new();
        };
        let mut candidates: Vec<(u64, u64, &RevisionId)> = tree
            .iter()
            .filter(|(id, node)| id.generation() < generation && node.body.is_some())
            .map(|(id, node)| (id.generation(), node.sequence, id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        candidates
            .into_iter()
            .take(limit)
            .map(|(_, _, id)| id.clone())
            .collect()
    }

    fn purge_revisions(&self, doc_id: &str, rev_ids: &[RevisionId]) -> StoreResult<Vec<RevisionId>> {
        let guard = self.begin();
        let removed = self.apply(|tx| {
            if tx.tree(doc_id).is_none() {
                return Vec::new();
            }
            let purge_all = rev_ids.iter().any(|rev_id| rev_id.as_str() == "*");
            let tree = tx.tree_mut(doc_id);
            let removed = if purge_all {
                tree.purge_all()
            } else {
                tree.purge(rev_ids)
            };
            tx.unindex(&removed);
            tx.remove_if_empty(doc_id);
            removed
        });
        guard.finish(true);

        if !removed.is_empty() {
            log_event(
                Event::Purge,
                &[("doc_id", doc_id), ("removed", &removed.len().to_string())],
            );
        }
        Ok(removed.into_iter().map(|(id, _)| id).collect())
    }

    fn compact(&self) -> StoreResult<CompactionReport> {
        let scope = ObservationScope::new(Event::Compaction, &[]);
        let depth = self.config.max_rev_tree_depth;
        let guard = self.begin();
        let report = self.apply(|tx| {
            let doc_ids: Vec<String> = tx.state.docs.keys().cloned().collect();
            let mut report = CompactionReport::default();
            for doc_id in doc_ids {
                let tree = tx.tree_mut(&doc_id);
                let removed = tree.prune(depth);
                report.bodies_dropped += tree.drop_ancestor_bodies();
                report.revisions_pruned += removed.len();
                tx.unindex(&removed);
            }
            report
        });
        if !guard.finish(true) {
            scope.fail("transaction rolled back");
            return Err(StoreError::Internal("compaction rolled back".to_string()));
        }
        scope.complete(&[
            ("revisions_pruned", &report.revisions_pruned.to_string()),
            ("bodies_dropped", &report.bodies_dropped.to_string()),
        ]);
        Ok(report)
    }

    fn document_count(&self) -> usize {
        self.read_state()
            .docs
            .values()
            .filter(|tree| !tree.is_empty() && !tree.is_deleted())
            .count()
    }

    fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_state().docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn last_sequence(&self) -> u64 {
        self.read_state().last_sequence
    }

    fn in_transaction(&self) -> bool {
        self.lock_slot().owner == Some(thread::current().id())
    }

    fn get_local_document(&self, doc_id: &str) -> Option<LocalDocument> {
        self.read_state().local_docs.get(doc_id).cloned()
    }

    fn put_local_document(
        &self,
        doc_id: &str,
        mut properties: Properties,
        prev_rev: Option<&RevisionId>,
        obey_mvcc: bool,
    ) -> StoreResult<RevisionId> {
        if doc_id.is_empty() {
            return Err(StoreError::Malformed("empty local document id".to_string()));
        }
        strip_special_keys(&mut properties);

        let guard = self.begin();
        let current = self.read_state().local_docs.get(doc_id).map(|doc| doc.rev_id.clone());
        if obey_mvcc {
            let outcome = match (&current, prev_rev) {
                (Some(current), Some(prev)) if current != prev => Err(StoreError::conflict(doc_id)),
                (Some(_), None) => Err(StoreError::conflict(doc_id)),
                (None, Some(prev)) => Err(StoreError::NotFound(format!(
                    "revision {} of local document '{}'",
                    prev, doc_id
                ))),
                _ => Ok(()),
            };
            if let Err(err) = outcome {
                guard.finish(false);
                return Err(err);
            }
        }

        let generation = current.as_ref().map(RevisionId::generation).unwrap_or(0);
        let rev_id = RevisionId::local(generation + 1);
        self.apply(|tx| {
            tx.put_local(LocalDocument {
                id: doc_id.to_string(),
                rev_id: rev_id.clone(),
                body: properties,
            })
        });
        guard.finish(true);
        Ok(rev_id)
    }

    fn set_info(&self, key: &str, value: &str) -> StoreResult<()> {
        let guard = self.begin();
        self.apply(|tx| tx.put_info(key, value));
        guard.finish(true);
        Ok(())
    }

    fn get_info(&self, key: &str) -> Option<String> {
        self.read_state().info.get(key).cloned()
    }
}
