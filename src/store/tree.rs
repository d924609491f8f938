//! RevTree - the parent-linked revisions of one document
//!
//! Invariants maintained by the store (not by this container):
//! - Every parent id named by a node is present in the tree
//! - A node's generation is one greater than its parent's
//!
//! Nodes whose ancestry was never known locally, or was pruned, have no
//! parent; they are roots. A tree may hold more than one root after
//! pruning or after replicating a history that shares nothing with the
//! local one.
//!
//! Leaves are nodes no other node names as parent. The current revision is
//! the greatest leaf under `RevisionId` ordering. Leaves are never sorted,
//! only scanned for their maximum.

use std::collections::{HashMap, HashSet};

use crate::revision::{Properties, Revision, RevisionId};

/// One retained revision.
#[derive(Clone, Debug, PartialEq)]
pub struct RevNode {
    pub parent: Option<RevisionId>,
    /// 0 for placeholders, which never appear in the change log.
    pub sequence: u64,
    pub deleted: bool,
    pub body: Option<Properties>,
    /// True if the body is not held: a placeholder ancestor or a
    /// compacted revision.
    pub missing: bool,
}

impl RevNode {
    /// A stored revision with its body.
    pub fn stored(parent: Option<RevisionId>, sequence: u64, deleted: bool, body: Properties) -> Self {
        Self {
            parent,
            sequence,
            deleted,
            body: Some(body),
            missing: false,
        }
    }

    /// An ancestor known only by id.
    pub fn placeholder(parent: Option<RevisionId>) -> Self {
        Self {
            parent,
            sequence: 0,
            deleted: false,
            body: None,
            missing: true,
        }
    }
}

/// All retained revisions of a single document.
#[derive(Clone, Debug, Default)]
pub struct RevTree {
    nodes: HashMap<RevisionId, RevNode>,
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn contains(&self, rev_id: &RevisionId) -> bool {
        self.nodes.contains_key(rev_id)
    }

    pub fn node(&self, rev_id: &RevisionId) -> Option<&RevNode> {
        self.nodes.get(rev_id)
    }

    pub fn node_mut(&mut self, rev_id: &RevisionId) -> Option<&mut RevNode> {
        self.nodes.get_mut(rev_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RevisionId, &RevNode)> {
        self.nodes.iter()
    }

    /// Insert a node. Returns false (and changes nothing) if the id exists.
    pub fn insert(&mut self, rev_id: RevisionId, node: RevNode) -> bool {
        if self.nodes.contains_key(&rev_id) {
            return false;
        }
        self.nodes.insert(rev_id, node);
        true
    }

    fn parent_set(&self) -> HashSet<&RevisionId> {
        self.nodes
            .values()
            .filter_map(|node| node.parent.as_ref())
            .collect()
    }

    /// Ids of all leaves, in no particular order.
    pub fn leaves(&self) -> Vec<&RevisionId> {
        let parents = self.parent_set();
        self.nodes
            .keys()
            .filter(|id| !parents.contains(id))
            .collect()
    }

    /// True if `rev_id` is present and has no children.
    pub fn is_leaf(&self, rev_id: &RevisionId) -> bool {
        self.contains(rev_id)
            && !self
                .nodes
                .values()
                .any(|node| node.parent.as_ref() == Some(rev_id))
    }

    /// The winning leaf.
    pub fn current(&self) -> Option<&RevisionId> {
        self.leaves().into_iter().max()
    }

    /// True if the current revision is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.current()
            .and_then(|id| self.nodes.get(id))
            .map(|node| node.deleted)
            .unwrap_or(false)
    }

    /// True if more than one leaf exists.
    pub fn in_conflict(&self) -> bool {
        self.leaves().len() > 1
    }

    /// Highest generation held.
    pub fn max_generation(&self) -> u64 {
        self.nodes.keys().map(RevisionId::generation).max().unwrap_or(0)
    }

    /// `rev_id` followed by its ancestors, newest first.
    pub fn ancestry(&self, rev_id: &RevisionId) -> Vec<RevisionId> {
        let mut chain = Vec::new();
        let mut cursor = Some(rev_id);
        while let Some(id) = cursor {
            let Some(node) = self.nodes.get(id) else {
                break;
            };
            chain.push(id.clone());
            // A malformed tree must not spin forever.
            if chain.len() > self.nodes.len() {
                break;
            }
            cursor = node.parent.as_ref();
        }
        chain
    }

    /// Materialize a node as a [`Revision`].
    pub fn revision(&self, doc_id: &str, rev_id: &RevisionId, with_body: bool) -> Option<Revision> {
        let node = self.nodes.get(rev_id)?;
        let revision = Revision::new(doc_id, rev_id.clone(), node.deleted)
            .with_sequence(node.sequence)
            .with_missing(node.missing);
        Some(match (&node.body, with_body) {
            (Some(body), true) => revision.with_body(body.clone()),
            _ => revision.without_body(),
        })
    }

    /// Remove non-leaf nodes more than `max_depth` generations below the
    /// newest generation. Children of removed nodes become roots.
    ///
    /// Returns the removed ids with their sequences.
    pub fn prune(&mut self, max_depth: u64) -> Vec<(RevisionId, u64)> {
        let max_generation = self.max_generation();
        if max_depth == 0 || max_generation <= max_depth {
            return Vec::new();
        }
        let floor = max_generation - max_depth;
        let leaves: HashSet<RevisionId> = self.leaves().into_iter().cloned().collect();
        let doomed: Vec<RevisionId> = self
            .nodes
            .keys()
            .filter(|id| id.generation() <= floor && !leaves.contains(*id))
            .cloned()
            .collect();
        self.remove_all(doomed)
    }

    /// Drop the bodies of every non-leaf revision. Returns how many were dropped.
    pub fn drop_ancestor_bodies(&mut self) -> usize {
        let parents: HashSet<RevisionId> = self.parent_set().into_iter().cloned().collect();
        let mut dropped = 0;
        for (id, node) in self.nodes.iter_mut() {
            if parents.contains(id) && node.body.is_some() {
                node.body = None;
                node.missing = true;
                dropped += 1;
            }
        }
        dropped
    }

    /// Remove the named leaves and every ancestor left without children.
    /// Ids that are absent or not leaves are ignored.
    pub fn purge(&mut self, rev_ids: &[RevisionId]) -> Vec<(RevisionId, u64)> {
        let mut removed = Vec::new();
        for rev_id in rev_ids {
            if !self.is_leaf(rev_id) {
                continue;
            }
            let mut cursor = Some(rev_id.clone());
            while let Some(id) = cursor.take() {
                if !self.is_leaf(&id) {
                    break;
                }
                if let Some(node) = self.nodes.remove(&id) {
                    cursor = node.parent;
                    removed.push((id, node.sequence));
                }
            }
        }
        removed
    }

    /// Remove every node.
    pub fn purge_all(&mut self) -> Vec<(RevisionId, u64)> {
        self.nodes
            .drain()
            .map(|(id, node)| (id, node.sequence))
            .collect()
    }

    fn remove_all(&mut self, doomed: Vec<RevisionId>) -> Vec<(RevisionId, u64)> {
        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(node) = self.nodes.remove(&id) {
                removed.push((id, node.sequence));
            }
        }
        let gone: HashSet<&RevisionId> = removed.iter().map(|(id, _)| id).collect();
        for node in self.nodes.values_mut() {
            if node.parent.as_ref().is_some_and(|parent| gone.contains(parent)) {
                node.parent = None;
            }
        }
        removed
    }
}
