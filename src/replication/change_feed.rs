//! Remote change feed reader
//!
//! ## Lifecycle
//!
//! `Stopped -> Running -> (Requesting -> Streaming)* -> Stopped`
//!
//! - `start()` spawns the request loop on the current tokio runtime and
//!   returns at once
//! - `stop()` cancels the in-flight request and any backoff sleep, then
//!   notifies the client before returning; the notification is sent
//!   exactly once per run
//! - A worker that finds no client aborts without touching the network
//! - Each entry waits for [`ChangeFeedClient::ready`] before delivery, so
//!   a slow client holds the reader back instead of queueing without bound
//!
//! ## Failure handling
//!
//! - Transport errors and truncated responses: retried after exponential
//!   backoff, silently dropped if a stop was already requested
//! - Non-success HTTP status: terminal, reported to the client
//! - Unparseable JSON or a long-poll body without `results`: terminal
//! - An entry without `seq` in a streamed array: counted and skipped

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{self, BoxFuture};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::backoff::Backoff;
use super::change_entry::{sequence_token, ChangeEntry};
use super::config::{BackoffConfig, FeedMode, ReplicationConfig};
use super::errors::{ReplicationError, ReplicationResult};
use super::json_stream::JsonArrayStream;
use super::session::ReplicationSession;
use crate::observability::{log_event, mask_credentials, Event, Logger, ReplicationMetrics};

/// Receives what the feed reads.
pub trait ChangeFeedClient: Send + Sync {
    /// Resolves once the client can take another entry.
    fn ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(future::ready(()))
    }

    /// An accepted entry, in feed order.
    fn change_received(&self, entry: ChangeEntry);

    /// The reader stopped; `error` is the terminating failure, if any.
    fn feed_stopped(&self, error: Option<&ReplicationError>);
}

/// Whether the request loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Stopped,
    Running,
}

/// Feed parameters, fixed for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFeedOptions {
    pub mode: FeedMode,
    pub filter: Option<String>,
    pub filter_params: Vec<(String, Value)>,
    pub doc_ids: Vec<String>,
    pub include_conflicts: bool,
    pub long_poll_limit: u32,
    pub heartbeat_ms: u64,
    pub backoff: BackoffConfig,
}

impl ChangeFeedOptions {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            mode: config.effective_mode(),
            filter: config.filter.clone(),
            filter_params: config
                .filter_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            doc_ids: config.doc_ids.clone(),
            include_conflicts: config.include_conflicts,
            long_poll_limit: config.long_poll_limit,
            heartbeat_ms: config.heartbeat_ms,
            backoff: config.backoff,
        }
    }
}

enum Cycle {
    /// Request again at once.
    Again,
    /// The response was complete; stop.
    Done,
}

struct FeedInner {
    session: Arc<ReplicationSession>,
    options: ChangeFeedOptions,
    last_sequence: Mutex<Option<Value>>,
    client: Mutex<Option<Arc<dyn ChangeFeedClient>>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    metrics: Arc<ReplicationMetrics>,
}

/// Reads a remote `_changes` feed on a background task.
pub struct ChangeFeedReader {
    inner: Arc<FeedInner>,
}

impl ChangeFeedReader {
    pub fn new(
        session: Arc<ReplicationSession>,
        options: ChangeFeedOptions,
        since: Option<Value>,
        client: Arc<dyn ChangeFeedClient>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                session,
                options,
                last_sequence: Mutex::new(since),
                client: Mutex::new(Some(client)),
                running: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                metrics,
            }),
        }
    }

    pub fn state(&self) -> FeedState {
        if self.inner.is_running() {
            FeedState::Running
        } else {
            FeedState::Stopped
        }
    }

    /// The last sequence token accepted from the feed.
    pub fn last_sequence(&self) -> Option<Value> {
        self.inner.last_sequence()
    }

    /// Replace the client; only takes effect for the next `start()`.
    pub fn set_client(&self, client: Arc<dyn ChangeFeedClient>) {
        *self.inner.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    /// The URL the next request will use.
    pub fn changes_url(&self) -> ReplicationResult<Url> {
        self.inner.changes_url()
    }

    /// Spawn the request loop. Requires a tokio runtime.
    pub fn start(&self) -> ReplicationResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| ReplicationError::config("change feed requires a tokio runtime"))?;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        log_event(
            Event::FeedStart,
            &[
                ("remote", self.inner.session.display_remote()),
                ("mode", self.inner.options.mode.feed_param()),
            ],
        );
        handle.spawn(run(Arc::clone(&self.inner), token));
        Ok(())
    }

    /// Stop the loop and notify the client before returning.
    pub fn stop(&self) {
        self.inner.stop(None);
    }
}

impl Drop for ChangeFeedReader {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner).cancel();
    }
}

impl FeedInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn client(&self) -> Option<Arc<dyn ChangeFeedClient>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn last_sequence(&self) -> Option<Value> {
        self.last_sequence.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_last_sequence(&self, seq: Value) {
        *self.last_sequence.lock().unwrap_or_else(PoisonError::into_inner) = Some(seq);
    }

    fn stop(&self, error: Option<ReplicationError>) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).cancel();

        let client = self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(client) = client else {
            return;
        };
        match &error {
            Some(err) => Logger::error(
                Event::FeedStopped.as_str(),
                &[("code", err.code()), ("error", &err.to_string())],
            ),
            None => log_event(Event::FeedStopped, &[("remote", self.session.display_remote())]),
        }
        client.feed_stopped(error.as_ref());
    }

    fn changes_url(&self) -> ReplicationResult<Url> {
        let options = &self.options;
        let mut query: Vec<(String, String)> = vec![
            ("feed".into(), options.mode.feed_param().into()),
            ("heartbeat".into(), options.heartbeat_ms.to_string()),
        ];
        if options.mode == FeedMode::LongPoll {
            query.push(("limit".into(), options.long_poll_limit.to_string()));
        }
        if let Some(since) = self.last_sequence() {
            query.push(("since".into(), sequence_token(&since)));
        }
        if options.include_conflicts {
            query.push(("style".into(), "all_docs".into()));
        }
        if let Some(filter) = &options.filter {
            query.push(("filter".into(), filter.clone()));
            for (key, value) in &options.filter_params {
                query.push((key.clone(), sequence_token(value)));
            }
        } else if !options.doc_ids.is_empty() {
            query.push(("filter".into(), "_doc_ids".into()));
            query.push(("doc_ids".into(), Value::from(options.doc_ids.clone()).to_string()));
        }

        let pairs: Vec<(&str, &str)> = query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.session.url_for(&["_changes"], &pairs)
    }

    /// Deliver one streamed entry; a bad entry is skipped.
    async fn receive_streamed(&self, value: Value) {
        match ChangeEntry::from_value(&value) {
            Ok(entry) => self.accept(entry).await,
            Err(err) => {
                self.metrics.increment_bad_entries();
                Logger::warn(Event::FeedBadEntry.as_str(), &[("error", &err.to_string())]);
            }
        }
    }

    /// Deliver a whole long-poll body. Any bad entry fails the response.
    async fn receive_poll_response(&self, body: &[u8]) -> ReplicationResult<()> {
        let response: Value = serde_json::from_slice(body)
            .map_err(|e| ReplicationError::malformed(format!("invalid long-poll response: {}", e)))?;
        let results = response
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| ReplicationError::malformed("long-poll response has no results"))?;

        for value in results {
            match ChangeEntry::from_value(value) {
                Ok(entry) => self.accept(entry).await,
                Err(err) => {
                    self.metrics.increment_bad_entries();
                    Logger::warn(Event::FeedBadEntry.as_str(), &[("error", &err.to_string())]);
                    return Err(err);
                }
            }
        }
        if let Some(last_seq) = response.get("last_seq").filter(|seq| !seq.is_null()) {
            self.set_last_sequence(last_seq.clone());
        }
        Ok(())
    }

    async fn accept(&self, entry: ChangeEntry) {
        let Some(client) = self.client() else {
            return;
        };
        client.ready().await;
        self.set_last_sequence(entry.seq().clone());
        self.metrics.increment_changes_received();
        client.change_received(entry);
    }

    async fn request_once(&self, url: Url) -> ReplicationResult<Cycle> {
        let response = self.session.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReplicationError::HttpStatus {
                status: status.as_u16(),
                url: mask_credentials(url.as_str()),
            });
        }

        if self.options.mode == FeedMode::LongPoll {
            let body = response
                .bytes()
                .await
                .map_err(|e| ReplicationError::Interrupted(e.to_string()))?;
            self.receive_poll_response(&body).await?;
            return Ok(Cycle::Again);
        }

        let mut stream = response.bytes_stream();
        let mut splitter = JsonArrayStream::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ReplicationError::Interrupted(e.to_string()))?;
            for value in splitter.feed(&chunk)? {
                self.receive_streamed(value).await;
            }
            if splitter.is_finished() {
                break;
            }
        }
        if !splitter.is_finished() {
            return Err(ReplicationError::Interrupted(
                "change feed ended before the array closed".into(),
            ));
        }
        Ok(Cycle::Done)
    }
}

async fn run(inner: Arc<FeedInner>, cancel: CancellationToken) {
    if inner.client().is_none() {
        inner.running.store(false, Ordering::SeqCst);
        Logger::warn(Event::FeedStopped.as_str(), &[("reason", "no client")]);
        return;
    }

    let mut backoff = Backoff::from_config(&inner.options.backoff);
    while inner.is_running() && !cancel.is_cancelled() {
        let url = match inner.changes_url() {
            Ok(url) => url,
            Err(err) => {
                inner.stop(Some(err));
                return;
            }
        };
        Logger::trace(Event::FeedRequest.as_str(), &[("url", &mask_credentials(url.as_str()))]);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = inner.request_once(url) => outcome,
        };

        match outcome {
            Ok(Cycle::Again) => backoff.reset(),
            Ok(Cycle::Done) => {
                inner.stop(None);
                return;
            }
            Err(err) if err.is_retryable() => {
                if !inner.is_running() {
                    return;
                }
                let delay = backoff.next_delay();
                inner.metrics.increment_feed_retries();
                Logger::warn(
                    Event::FeedBackoff.as_str(),
                    &[
                        ("error", &err.to_string()),
                        ("attempt", &backoff.attempts().to_string()),
                        ("delay_ms", &delay.as_millis().to_string()),
                    ],
                );
                if !Backoff::sleep(delay, &cancel).await {
                    return;
                }
            }
            Err(err) => {
                inner.stop(Some(err));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Recorder {
        entries: Mutex<Vec<ChangeEntry>>,
        stops: Mutex<Vec<Option<String>>>,
    }

    impl ChangeFeedClient for Recorder {
        fn change_received(&self, entry: ChangeEntry) {
            self.entries.lock().unwrap().push(entry);
        }

        fn feed_stopped(&self, error: Option<&ReplicationError>) {
            self.stops.lock().unwrap().push(error.map(|e| e.code().to_string()));
        }
    }

    fn reader(config: ReplicationConfig, since: Option<Value>) -> (ChangeFeedReader, Arc<Recorder>) {
        let session = Arc::new(ReplicationSession::new(&config).unwrap());
        let recorder = Arc::new(Recorder::default());
        let reader = ChangeFeedReader::new(
            session,
            ChangeFeedOptions::from_config(&config),
            since,
            recorder.clone(),
            Arc::new(ReplicationMetrics::new()),
        );
        (reader, recorder)
    }

    fn config() -> ReplicationConfig {
        ReplicationConfig::new(Url::parse("http://localhost:5984/db").unwrap())
    }

    #[test]
    fn test_one_shot_url() {
        let (reader, _) = reader(config(), Some(json!(42)));
        let url = reader.changes_url().unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:5984/db/_changes?feed=normal&heartbeat=300000&since=42"
        );
    }

    #[test]
    fn test_long_poll_url_with_filter() {
        let mut config = config();
        config.mode = FeedMode::LongPoll;
        config.include_conflicts = true;
        config.filter = Some("app/owned".into());
        config.filter_params = BTreeMap::from([("owner".to_string(), json!("bob"))]);
        let (reader, _) = reader(config, None);
        let url = reader.changes_url().unwrap();
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("feed".into(), "longpoll".into())));
        assert!(query.contains(&("limit".into(), "50".into())));
        assert!(query.contains(&("style".into(), "all_docs".into())));
        assert!(query.contains(&("filter".into(), "app/owned".into())));
        assert!(query.contains(&("owner".into(), "bob".into())));
        assert!(!query.iter().any(|(k, _)| k == "since"));
    }

    #[test]
    fn test_doc_ids_url() {
        let mut config = config();
        config.doc_ids = vec!["a".into(), "b".into()];
        let (reader, _) = reader(config, None);
        let query: Vec<(String, String)> =
            reader.changes_url().unwrap().query_pairs().into_owned().collect();
        assert!(query.contains(&("filter".into(), "_doc_ids".into())));
        assert!(query.contains(&("doc_ids".into(), "[\"a\",\"b\"]".into())));
    }

    #[tokio::test]
    async fn test_poll_response_updates_sequence() {
        let (reader, recorder) = reader(config(), None);
        let body = json!({
            "results": [{"seq": 1, "id": "a", "changes": [{"rev": "1-x"}]},
                        {"seq": 2, "id": "b", "changes": [{"rev": "1-y"}]}],
            "last_seq": 5
        });
        reader
            .inner
            .receive_poll_response(&serde_json::to_vec(&body).unwrap())
            .await
            .unwrap();
        assert_eq!(recorder.entries.lock().unwrap().len(), 2);
        assert_eq!(reader.last_sequence(), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_poll_response_stops_at_bad_entry() {
        let (reader, recorder) = reader(config(), None);
        let body = br#"{"results": [{"seq": 1, "id": "a"}, {"id": "b"}, {"seq": 3, "id": "c"}]}"#;
        let err = reader.inner.receive_poll_response(body).await.unwrap_err();
        assert_eq!(err.code(), "REV_REPL_MALFORMED");
        assert_eq!(recorder.entries.lock().unwrap().len(), 1);
        assert_eq!(reader.last_sequence(), Some(json!(1)));

        assert!(reader
            .inner
            .receive_poll_response(br#"{"last_seq": 3}"#)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_streamed_bad_entry_is_skipped() {
        let (reader, recorder) = reader(config(), None);
        reader.inner.receive_streamed(json!({"id": "no-seq"})).await;
        reader.inner.receive_streamed(json!({"seq": "7-abc", "id": "ok"})).await;
        assert_eq!(recorder.entries.lock().unwrap().len(), 1);
        assert_eq!(reader.inner.metrics.snapshot().bad_entries, 1);
        assert_eq!(reader.last_sequence(), Some(json!("7-abc")));
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (reader, _) = reader(config(), None);
        assert_eq!(reader.start().unwrap_err().code(), "REV_REPL_CONFIG");
        assert_eq!(reader.state(), FeedState::Stopped);
    }

    #[test]
    fn test_stop_notifies_once() {
        let (reader, recorder) = reader(config(), None);
        reader.stop();
        reader.stop();
        assert_eq!(recorder.stops.lock().unwrap().as_slice(), &[None]);
    }

    #[tokio::test]
    async fn test_stop_right_after_start() {
        let (reader, recorder) = reader(config(), None);
        reader.start().unwrap();
        assert_eq!(reader.state(), FeedState::Running);
        reader.stop();
        assert_eq!(reader.state(), FeedState::Stopped);
        tokio::task::yield_now().await;
        assert_eq!(recorder.stops.lock().unwrap().len(), 1);
        assert!(recorder.entries.lock().unwrap().is_empty());
    }
}
