//! Shared fixtures for integration tests
//!
//! `MockRemote` is an in-process axum server standing in for a remote
//! database: `GET /db/_changes` and `GET /db/<doc>?rev=...`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

use revdb::revision::{Properties, Revision, RevisionId};
use revdb::store::{blob_digest, open_store, AcceptAll, DocumentStore, StoreConfig};

// =============================================================================
// Store helpers
// =============================================================================

pub fn memory_store() -> Arc<dyn DocumentStore> {
    open_store(&StoreConfig::default(), None).unwrap()
}

pub fn props(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

pub fn rev(id: &str) -> RevisionId {
    RevisionId::from(id)
}

/// Force-insert `history[0]` of `doc_id` with a small body.
pub fn force(store: &dyn DocumentStore, doc_id: &str, history: &[&str]) {
    let history: Vec<RevisionId> = history.iter().map(|id| rev(id)).collect();
    let revision = Revision::new(doc_id, history[0].clone(), false)
        .with_body(props(json!({ "rev": history[0].as_str() })));
    store.force_insert(revision, &history, &AcceptAll, None).unwrap();
}

// =============================================================================
// Wire helpers
// =============================================================================

/// A remote document as served with `revs=true`.
pub fn remote_document(doc_id: &str, history: &[&str], body: Value) -> Value {
    let mut document = props(body);
    let start = rev(history[0]).generation();
    let ids: Vec<&str> = history
        .iter()
        .map(|&id| id.split_once('-').map(|(_, suffix)| suffix).unwrap_or(id))
        .collect();
    document.insert("_id".into(), json!(doc_id));
    document.insert("_rev".into(), json!(history[0]));
    document.insert("_revisions".into(), json!({ "start": start, "ids": ids }));
    Value::Object(document)
}

/// Attachment stubs announcing `attachments` as following MIME bodies.
pub fn following_stubs(attachments: &[(&str, &[u8])]) -> Value {
    let mut stubs = serde_json::Map::new();
    for (name, data) in attachments {
        stubs.insert(
            name.to_string(),
            json!({
                "follows": true,
                "content_type": "application/octet-stream",
                "length": data.len(),
                "digest": blob_digest(data),
            }),
        );
    }
    Value::Object(stubs)
}

/// `multipart/related` body: the JSON document, then one part per
/// attachment.
pub fn multipart_body(boundary: &str, document: &Value, attachments: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = format!("--{}\r\nContent-Type: application/json\r\n\r\n", boundary).into_bytes();
    body.extend(serde_json::to_vec(document).unwrap());
    for (name, data) in attachments {
        body.extend(
            format!(
                "\r\n--{}\r\nContent-Disposition: attachment; filename=\"{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                boundary, name
            )
            .into_bytes(),
        );
        body.extend_from_slice(data);
    }
    body.extend(format!("\r\n--{}--\r\n", boundary).into_bytes());
    body
}

// =============================================================================
// Mock remote
// =============================================================================

#[derive(Clone)]
enum MockBody {
    Json(Value),
    Multipart { boundary: String, body: Vec<u8> },
}

#[derive(Default)]
pub struct RemoteState {
    changes: Mutex<Vec<Value>>,
    docs: Mutex<HashMap<(String, String), MockBody>>,
    truncate_changes: AtomicUsize,
    hang_changes: AtomicBool,
    changes_status: Mutex<Option<u16>>,
    changes_queries: Mutex<Vec<HashMap<String, String>>>,
    authorization: Mutex<Vec<Option<String>>>,
    doc_requests: AtomicUsize,
    seq: AtomicU64,
}

impl RemoteState {
    /// Query parameters of every `_changes` request so far.
    pub fn changes_queries(&self) -> Vec<HashMap<String, String>> {
        self.changes_queries.lock().unwrap().clone()
    }

    /// `Authorization` header of every request so far.
    pub fn authorization(&self) -> Vec<Option<String>> {
        self.authorization.lock().unwrap().clone()
    }

    pub fn doc_requests(&self) -> usize {
        self.doc_requests.load(Ordering::SeqCst)
    }

    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.authorization.lock().unwrap().push(value);
    }
}

pub struct MockRemote {
    pub url: Url,
    pub state: Arc<RemoteState>,
    task: JoinHandle<()>,
}

impl MockRemote {
    pub async fn start() -> Self {
        let state = Arc::new(RemoteState::default());
        let app = Router::new()
            .route("/db/_changes", get(changes))
            .route("/db/:doc", get(document))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: Url::parse(&format!("http://{}/db", addr)).unwrap(),
            state,
            task,
        }
    }

    /// Publish a JSON revision and its change entry; returns the seq.
    pub fn add_revision(&self, doc_id: &str, history: &[&str], body: Value) -> u64 {
        let document = remote_document(doc_id, history, body);
        self.publish(doc_id, history[0], MockBody::Json(document), false)
    }

    /// Publish a tombstone.
    pub fn add_deletion(&self, doc_id: &str, history: &[&str]) -> u64 {
        let document = remote_document(doc_id, history, json!({ "_deleted": true }));
        self.publish(doc_id, history[0], MockBody::Json(document), true)
    }

    /// Publish a revision served as `multipart/related`.
    pub fn add_multipart_revision(
        &self,
        doc_id: &str,
        history: &[&str],
        body: Value,
        attachments: &[(&str, &[u8])],
    ) -> u64 {
        let mut document = remote_document(doc_id, history, body);
        document["_attachments"] = following_stubs(attachments);
        let boundary = format!("mock-{}", doc_id);
        let body = multipart_body(&boundary, &document, attachments);
        self.publish(doc_id, history[0], MockBody::Multipart { boundary, body }, false)
    }

    /// Announce a change whose revision cannot be fetched.
    pub fn add_unfetchable_change(&self, doc_id: &str, rev_id: &str) -> u64 {
        self.push_change(doc_id, rev_id, false)
    }

    /// Truncate the next `count` non-long-poll `_changes` responses.
    pub fn truncate_next_changes(&self, count: usize) {
        self.state.truncate_changes.store(count, Ordering::SeqCst);
    }

    /// Accept `_changes` requests but never answer them.
    pub fn hang_changes(&self) {
        self.state.hang_changes.store(true, Ordering::SeqCst);
    }

    /// Answer every `_changes` request with `status`.
    pub fn fail_changes_with(&self, status: u16) {
        *self.state.changes_status.lock().unwrap() = Some(status);
    }

    fn publish(&self, doc_id: &str, rev_id: &str, body: MockBody, deleted: bool) -> u64 {
        self.state
            .docs
            .lock()
            .unwrap()
            .insert((doc_id.to_string(), rev_id.to_string()), body);
        self.push_change(doc_id, rev_id, deleted)
    }

    fn push_change(&self, doc_id: &str, rev_id: &str, deleted: bool) -> u64 {
        let mut changes = self.state.changes.lock().unwrap();
        changes.retain(|entry| entry["id"] != json!(doc_id));
        let seq = self.state.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entry = json!({ "seq": seq, "id": doc_id, "changes": [{ "rev": rev_id }] });
        if deleted {
            entry["deleted"] = json!(true);
        }
        changes.push(entry);
        seq
    }
}

impl Drop for MockRemote {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn changes(
    State(state): State<Arc<RemoteState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    state.record_auth(&headers);
    state.changes_queries.lock().unwrap().push(params.clone());
    if let Some(status) = *state.changes_status.lock().unwrap() {
        return StatusCode::from_u16(status).unwrap().into_response();
    }
    if state.hang_changes.load(Ordering::SeqCst) {
        return std::future::pending::<Response>().await;
    }

    let since: u64 = params.get("since").and_then(|s| s.parse().ok()).unwrap_or(0);
    let doc_ids: Option<Vec<String>> = params
        .get("doc_ids")
        .and_then(|ids| serde_json::from_str(ids).ok());
    let mut entries: Vec<Value> = state
        .changes
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry["seq"].as_u64().unwrap_or(0) > since)
        .filter(|entry| match &doc_ids {
            Some(ids) => ids.iter().any(|id| entry["id"] == json!(id)),
            None => true,
        })
        .cloned()
        .collect();

    if params.get("feed").map(String::as_str) == Some("longpoll") {
        if let Some(limit) = params.get("limit").and_then(|l| l.parse().ok()) {
            entries.truncate(limit);
        }
        if entries.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let last_seq = entries.last().map(|e| e["seq"].clone()).unwrap_or(json!(since));
        return Json(json!({ "results": entries, "last_seq": last_seq })).into_response();
    }

    let truncate = state
        .truncate_changes
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let body = if truncate {
        match entries.first() {
            Some(first) => format!("{{\"results\":[{}", first),
            None => "{\"results\":[".to_string(),
        }
    } else {
        let last_seq = entries.last().map(|e| e["seq"].clone()).unwrap_or(json!(since));
        json!({ "results": entries, "last_seq": last_seq }).to_string()
    };
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn document(
    State(state): State<Arc<RemoteState>>,
    Path(doc_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    state.record_auth(&headers);
    state.doc_requests.fetch_add(1, Ordering::SeqCst);
    let rev_id = params.get("rev").cloned().unwrap_or_default();
    let body = state.docs.lock().unwrap().get(&(doc_id, rev_id)).cloned();
    match body {
        Some(MockBody::Json(document)) => Json(document).into_response(),
        Some(MockBody::Multipart { boundary, body }) => (
            [(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary=\"{}\"", boundary),
            )],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
