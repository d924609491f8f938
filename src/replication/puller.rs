//! Pull replication session
//!
//! Wires a [`ChangeFeedReader`] to a [`ReplicationIngestPipeline`] for one
//! remote database:
//!
//! - The feed runs on its own task and hands entries over a bounded
//!   channel; when ingest falls behind, the feed waits for a free slot
//! - Entries are ingested one at a time, in feed order
//! - After each entry the checkpoint advances to its sequence token
//! - A terminal feed failure ends the run with the error in the summary
//! - A fatal store error ends the run with `Err`
//!
//! A one-shot pull returns once the feed reaches the end of its response;
//! long-poll and continuous pulls run until [`Puller::stop`].

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::change_entry::ChangeEntry;
use super::change_feed::{ChangeFeedClient, ChangeFeedOptions, ChangeFeedReader};
use super::checkpoint::Checkpoint;
use super::config::ReplicationConfig;
use super::errors::{ReplicationError, ReplicationResult};
use super::fetcher::RevisionFetcher;
use super::ingest::ReplicationIngestPipeline;
use super::session::ReplicationSession;
use crate::observability::{Event, MetricsSnapshot, ObservationScope, ReplicationMetrics};
use crate::store::{BlobStore, DocumentStore, ValidationHook};

/// Where a puller is in its life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PullerStatus {
    Idle,
    Active,
    Stopped { error: Option<String> },
}

/// Result of one `run`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullSummary {
    /// Sequence token of the last fully processed entry.
    pub last_sequence: Option<Value>,
    /// Terminal feed failure, if the feed did not end cleanly.
    pub error: Option<String>,
    pub metrics: MetricsSnapshot,
}

/// Entries read from the feed but not yet ingested.
const INGEST_QUEUE_DEPTH: usize = 64;

/// Hands feed entries to the ingest loop. `ready` reserves a queue slot
/// that the next `change_received` fills.
struct ChannelClient {
    changes: mpsc::Sender<ChangeEntry>,
    permit: Mutex<Option<OwnedPermit<ChangeEntry>>>,
    stopped: Mutex<Option<oneshot::Sender<Option<String>>>>,
}

impl ChannelClient {
    fn new(changes: mpsc::Sender<ChangeEntry>, stopped: oneshot::Sender<Option<String>>) -> Self {
        Self {
            changes,
            permit: Mutex::new(None),
            stopped: Mutex::new(Some(stopped)),
        }
    }
}

impl ChangeFeedClient for ChannelClient {
    fn ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Ok(permit) = self.changes.clone().reserve_owned().await {
                *self.permit.lock().unwrap_or_else(PoisonError::into_inner) = Some(permit);
            }
        })
    }

    fn change_received(&self, entry: ChangeEntry) {
        let permit = self.permit.lock().unwrap_or_else(PoisonError::into_inner).take();
        match permit {
            Some(permit) => {
                permit.send(entry);
            }
            None => {
                let _ = self.changes.try_send(entry);
            }
        }
    }

    fn feed_stopped(&self, error: Option<&ReplicationError>) {
        let sender = self.stopped.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(error.map(|e| e.to_string()));
        }
    }
}

/// Pulls one remote database into a local store.
pub struct Puller {
    config: ReplicationConfig,
    store: Arc<dyn DocumentStore>,
    validator: Arc<dyn ValidationHook>,
    session: Arc<ReplicationSession>,
    blobs: BlobStore,
    metrics: Arc<ReplicationMetrics>,
    checkpoint: Checkpoint,
    status: Mutex<PullerStatus>,
    cancel: CancellationToken,
}

impl Puller {
    pub fn new(
        config: ReplicationConfig,
        store: Arc<dyn DocumentStore>,
        validator: Arc<dyn ValidationHook>,
    ) -> ReplicationResult<Self> {
        let session = Arc::new(ReplicationSession::new(&config)?);
        let checkpoint = Checkpoint::new(Arc::clone(&store), session.remote(), &config);
        Ok(Self {
            config,
            store,
            validator,
            session,
            blobs: BlobStore::new(),
            metrics: Arc::new(ReplicationMetrics::new()),
            checkpoint,
            status: Mutex::new(PullerStatus::Idle),
            cancel: CancellationToken::new(),
        })
    }

    /// Store attachments in `blobs` instead of a private blob store.
    pub fn with_blobs(mut self, blobs: BlobStore) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn status(&self) -> PullerStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn session(&self) -> &ReplicationSession {
        &self.session
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Ask a running pull to finish. The current entry is abandoned and
    /// its sequence is not checkpointed.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn set_status(&self, status: PullerStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Run the pull until the feed stops or `stop` is called.
    pub async fn run(&self) -> ReplicationResult<PullSummary> {
        self.set_status(PullerStatus::Active);
        let scope = ObservationScope::new(
            Event::Pull,
            &[
                ("remote", self.session.display_remote()),
                ("mode", self.config.effective_mode().feed_param()),
            ],
        );

        let since = self.checkpoint.load();
        let (changes_tx, mut changes) = mpsc::channel(INGEST_QUEUE_DEPTH);
        let (stopped_tx, stopped) = oneshot::channel();
        let feed = ChangeFeedReader::new(
            Arc::clone(&self.session),
            ChangeFeedOptions::from_config(&self.config),
            since.clone(),
            Arc::new(ChannelClient::new(changes_tx, stopped_tx)),
            Arc::clone(&self.metrics),
        );
        let pipeline = ReplicationIngestPipeline::new(
            Arc::clone(&self.store),
            RevisionFetcher::new(Arc::clone(&self.session), self.blobs.clone()),
            Arc::clone(&self.validator),
            self.session.remote().clone(),
            Arc::clone(&self.metrics),
        );

        if let Err(err) = feed.start() {
            return Err(self.fail(scope, err));
        }

        let mut last_sequence = since;
        let mut feed_error = None;
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = changes.recv() => received,
            };
            // The channel closes once the feed has stopped and dropped its
            // client, after every delivered entry has been received.
            let Some(entry) = received else {
                feed_error = stopped.await.ok().flatten();
                break;
            };
            match pipeline.ingest(&entry, &self.cancel).await {
                Ok(_) => {}
                Err(ReplicationError::Stopped) => break,
                Err(err) => {
                    feed.stop();
                    return Err(self.fail(scope, err));
                }
            }
            if let Err(err) = self.checkpoint.save(entry.seq()) {
                feed.stop();
                return Err(self.fail(scope, err));
            }
            last_sequence = Some(entry.seq().clone());
        }
        feed.stop();

        let summary = PullSummary {
            last_sequence,
            error: feed_error.clone(),
            metrics: self.metrics.snapshot(),
        };
        match &feed_error {
            Some(error) => scope.fail(error),
            None => {
                let inserted = summary.metrics.revisions_inserted.to_string();
                scope.complete(&[("revisions_inserted", &inserted)]);
            }
        }
        self.set_status(PullerStatus::Stopped { error: feed_error });
        Ok(summary)
    }

    fn fail(&self, scope: ObservationScope, err: ReplicationError) -> ReplicationError {
        scope.fail(&err.to_string());
        self.set_status(PullerStatus::Stopped {
            error: Some(err.to_string()),
        });
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AcceptAll, MemoryStore, StoreConfig};
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    fn puller() -> Puller {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new(StoreConfig::default(), None));
        let config = ReplicationConfig::new(Url::parse("http://user:pw@localhost:5984/db").unwrap());
        Puller::new(config, store, Arc::new(AcceptAll)).unwrap()
    }

    #[test]
    fn test_new_puller_is_idle() {
        let puller = puller();
        assert_eq!(puller.status(), PullerStatus::Idle);
        assert_eq!(puller.metrics(), MetricsSnapshot::default());
        assert!(puller.session().has_credentials());
        assert!(puller.checkpoint().load().is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new(StoreConfig::default(), None));
        let mut config = ReplicationConfig::new(Url::parse("http://localhost/db").unwrap());
        config.long_poll_limit = 0;
        assert!(Puller::new(config, store, Arc::new(AcceptAll)).is_err());
    }

    #[tokio::test]
    async fn test_stopped_before_run_returns_quickly() {
        let puller = puller();
        puller.stop();
        let summary = puller.run().await.unwrap();
        assert_eq!(summary.last_sequence, None);
        assert_eq!(puller.status(), PullerStatus::Stopped { error: None });
    }

    #[tokio::test]
    async fn test_channel_client_waits_for_room() {
        let (changes_tx, mut changes) = mpsc::channel(1);
        let (stopped_tx, stopped) = oneshot::channel();
        let client = ChannelClient::new(changes_tx, stopped_tx);

        client.ready().await;
        client.change_received(ChangeEntry::new(json!(1), "a", vec!["1-a".into()], false));
        let full = tokio::time::timeout(Duration::from_millis(50), client.ready()).await;
        assert!(full.is_err());

        assert_eq!(changes.recv().await.unwrap().doc_id(), "a");
        client.ready().await;
        client.change_received(ChangeEntry::new(json!(2), "b", vec!["1-b".into()], false));
        client.feed_stopped(None);
        drop(client);

        assert_eq!(changes.recv().await.unwrap().doc_id(), "b");
        assert!(changes.recv().await.is_none());
        assert_eq!(stopped.await.unwrap(), None);
    }

    #[test]
    fn test_status_serializes_with_state_tag() {
        let status = PullerStatus::Stopped {
            error: Some("boom".into()),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["error"], "boom");
    }
}
