//! Validation hooks
//!
//! The store consults a hook before every insertion. The hook sees the new
//! revision and the parent revision (if one is known locally) and either
//! accepts or vetoes with a [`ValidationError`]. A veto aborts the whole
//! insertion with no state change.
//!
//! Hooks are passed explicitly on each call; the store keeps none of its own.
//! Conflict policy lives in which write path is used (`put_revision` versus
//! `force_insert`), and any additional acceptance rule lives here.

use super::errors::ValidationError;
use crate::revision::Revision;

/// Decides whether a revision may be inserted.
pub trait ValidationHook: Send + Sync {
    /// Accept (`Ok`) or veto (`Err`) `new_revision`.
    fn validate(
        &self,
        new_revision: &Revision,
        parent: Option<&Revision>,
    ) -> Result<(), ValidationError>;
}

impl<F> ValidationHook for F
where
    F: Fn(&Revision, Option<&Revision>) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate(
        &self,
        new_revision: &Revision,
        parent: Option<&Revision>,
    ) -> Result<(), ValidationError> {
        self(new_revision, parent)
    }
}

/// Hook that accepts every revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ValidationHook for AcceptAll {
    fn validate(&self, _: &Revision, _: Option<&Revision>) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Hook that rejects tombstones; useful for read-mostly mirrors.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectDeletions;

impl ValidationHook for RejectDeletions {
    fn validate(&self, new_revision: &Revision, _: Option<&Revision>) -> Result<(), ValidationError> {
        if new_revision.is_deleted() {
            return Err(ValidationError::new("deletions are not accepted"));
        }
        Ok(())
    }
}
