//! Replication ingest pipeline
//!
//! For each change entry:
//!
//! 1. Drop revisions already in the local store
//! 2. Fetch the rest, with their advertised ancestry
//! 3. `force_insert` each one under the caller's validation hook
//!
//! Failures are per revision: a rejected, malformed or unfetchable
//! revision is counted and logged and the next one proceeds. Only a fatal
//! store error (an invariant violation) is returned to the caller.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use super::change_entry::ChangeEntry;
use super::errors::{ReplicationError, ReplicationResult};
use super::fetcher::{FetchedRevision, RevisionFetcher};
use crate::observability::{log_event, mask_credentials, Event, Logger, ReplicationMetrics};
use crate::revision::RevisionId;
use crate::store::{DocumentStore, StoreError, ValidationHook};

/// What happened to one advertised revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Already present locally.
    Skipped,
    Inserted,
    /// Vetoed by the validation hook.
    Rejected(String),
    /// Could not be fetched or stored.
    Failed(String),
}

/// Outcomes for every revision of one change entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub outcomes: Vec<(RevisionId, IngestOutcome)>,
}

impl IngestReport {
    fn count(&self, wanted: fn(&IngestOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| wanted(outcome)).count()
    }

    pub fn inserted(&self) -> usize {
        self.count(|o| matches!(o, IngestOutcome::Inserted))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, IngestOutcome::Skipped))
    }

    pub fn rejected(&self) -> usize {
        self.count(|o| matches!(o, IngestOutcome::Rejected(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, IngestOutcome::Failed(_)))
    }
}

/// Moves remote revisions into the local store.
pub struct ReplicationIngestPipeline {
    store: Arc<dyn DocumentStore>,
    fetcher: RevisionFetcher,
    validator: Arc<dyn ValidationHook>,
    source: Url,
    metrics: Arc<ReplicationMetrics>,
}

impl ReplicationIngestPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        fetcher: RevisionFetcher,
        validator: Arc<dyn ValidationHook>,
        source: Url,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        Self {
            store,
            fetcher,
            validator,
            source,
            metrics,
        }
    }

    /// The revisions of `entry` not yet stored locally, in feed order.
    pub fn missing_revisions(&self, entry: &ChangeEntry) -> Vec<RevisionId> {
        let wanted: Vec<(String, RevisionId)> = entry
            .revisions()
            .iter()
            .map(|rev| (entry.doc_id().to_string(), rev.clone()))
            .collect();
        self.store
            .find_missing_revisions(&wanted)
            .into_iter()
            .map(|(_, rev)| rev)
            .collect()
    }

    /// Ingest every revision `entry` advertises.
    pub async fn ingest(
        &self,
        entry: &ChangeEntry,
        cancel: &CancellationToken,
    ) -> ReplicationResult<IngestReport> {
        let missing = self.missing_revisions(entry);
        let mut report = IngestReport::default();

        for rev_id in entry.revisions() {
            if !missing.contains(rev_id) {
                self.metrics.increment_revisions_skipped();
                Logger::trace(
                    Event::IngestSkipped.as_str(),
                    &[("doc_id", entry.doc_id()), ("rev_id", rev_id.as_str())],
                );
                report.outcomes.push((rev_id.clone(), IngestOutcome::Skipped));
            }
        }

        for rev_id in missing {
            if cancel.is_cancelled() {
                return Err(ReplicationError::Stopped);
            }
            let outcome = match self.fetcher.fetch(entry.doc_id(), &rev_id, cancel).await {
                Ok(fetched) => self.insert(fetched)?,
                Err(ReplicationError::Stopped) => return Err(ReplicationError::Stopped),
                Err(err) => {
                    self.metrics.increment_fetch_failures();
                    self.log_failure(entry.doc_id(), &rev_id, &err.to_string());
                    IngestOutcome::Failed(err.to_string())
                }
            };
            report.outcomes.push((rev_id, outcome));
        }
        Ok(report)
    }

    /// Store one fetched revision. Errs only on a fatal store error.
    pub fn insert(&self, fetched: FetchedRevision) -> ReplicationResult<IngestOutcome> {
        let doc_id = fetched.revision.doc_id().to_string();
        let rev_id = fetched.revision.rev_id().clone();
        let attachments = fetched.attachments.len() as u64;

        match self.store.force_insert(
            fetched.revision,
            &fetched.history,
            self.validator.as_ref(),
            Some(&self.source),
        ) {
            Ok(()) => {
                self.metrics.increment_revisions_inserted();
                self.metrics.add_attachments_received(attachments);
                log_event(
                    Event::IngestAccepted,
                    &[
                        ("doc_id", &doc_id),
                        ("rev_id", rev_id.as_str()),
                        ("source", &mask_credentials(self.source.as_str())),
                    ],
                );
                Ok(IngestOutcome::Inserted)
            }
            Err(StoreError::ValidationRejected { source, .. }) => {
                self.metrics.increment_revisions_rejected();
                Ok(IngestOutcome::Rejected(source.reason().to_string()))
            }
            Err(err) if err.is_fatal() => {
                self.log_failure(&doc_id, &rev_id, &err.to_string());
                Err(err.into())
            }
            Err(err) => {
                self.metrics.increment_fetch_failures();
                self.log_failure(&doc_id, &rev_id, &err.to_string());
                Ok(IngestOutcome::Failed(err.to_string()))
            }
        }
    }

    fn log_failure(&self, doc_id: &str, rev_id: &RevisionId, reason: &str) {
        Logger::warn(
            Event::IngestFailed.as_str(),
            &[("doc_id", doc_id), ("rev_id", rev_id.as_str()), ("reason", reason)],
        );
    }
}
