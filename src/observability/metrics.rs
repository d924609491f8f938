//! Replication counters
//!
//! - Counters only, monotonic
//! - Lock-free, `Relaxed` ordering
//! - Snapshot is serializable for the CLI summary

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one pull session.
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    changes_received: AtomicU64,
    bad_entries: AtomicU64,
    revisions_inserted: AtomicU64,
    revisions_skipped: AtomicU64,
    revisions_rejected: AtomicU64,
    fetch_failures: AtomicU64,
    feed_retries: AtomicU64,
    attachments_received: AtomicU64,
}

impl ReplicationMetrics {
    /// Create a registry with every counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_changes_received(&self) {
        self.changes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_bad_entries(&self) {
        self.bad_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_revisions_inserted(&self) {
        self.revisions_inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_revisions_skipped(&self) {
        self.revisions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_revisions_rejected(&self) {
        self.revisions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fetch_failures(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_feed_retries(&self) {
        self.feed_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_attachments_received(&self, count: u64) {
        self.attachments_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            changes_received: self.changes_received.load(Ordering::Relaxed),
            bad_entries: self.bad_entries.load(Ordering::Relaxed),
            revisions_inserted: self.revisions_inserted.load(Ordering::Relaxed),
            revisions_skipped: self.revisions_skipped.load(Ordering::Relaxed),
            revisions_rejected: self.revisions_rejected.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            feed_retries: self.feed_retries.load(Ordering::Relaxed),
            attachments_received: self.attachments_received.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`ReplicationMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub changes_received: u64,
    pub bad_entries: u64,
    pub revisions_inserted: u64,
    pub revisions_skipped: u64,
    pub revisions_rejected: u64,
    pub fetch_failures: u64,
    pub feed_retries: u64,
    pub attachments_received: u64,
}
