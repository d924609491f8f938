//! Sequence Authority - database-wide sequence assignment
//!
//! - Sequences are strictly increasing and never reused
//! - A sequence handed out inside a transaction that later rolls back is
//!   lost, leaving a gap; gaps are allowed, reuse is not
//! - Only stored (non-placeholder) revisions receive a sequence
//!
//! The authority lives outside the transactional state so that a rollback
//! cannot rewind it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceAuthority {
    /// The highest sequence ever handed out.
    highest: AtomicU64,
}

impl SequenceAuthority {
    /// Create an authority starting from zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an authority that continues after `highest`.
    pub fn resume_after(highest: u64) -> Self {
        Self {
            highest: AtomicU64::new(highest),
        }
    }

    /// Allocate the next sequence number.
    pub fn allocate(&self) -> u64 {
        self.highest.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest sequence handed out so far (0 if none).
    pub fn highest(&self) -> u64 {
        self.highest.load(Ordering::SeqCst)
    }
}
