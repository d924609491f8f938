//! Pull Replication Tests
//!
//! End-to-end pulls from an in-process remote into a memory store:
//! - JSON and multipart revisions, tombstones and deep histories
//! - Conflicting local and remote edits both survive
//! - Checkpoints let a second pull start where the first stopped
//! - Fetch failures and validation vetoes do not stop the pull
//! - Feed failures end the pull with an error summary

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{memory_store, props, rev, MockRemote};
use revdb::cli::{pull_into, store_summary, Config};
use revdb::replication::{Puller, PullerStatus, ReplicationConfig};
use revdb::revision::RevisionId;
use revdb::store::{blob_digest, AcceptAll, BlobStore, DocumentStore, RejectDeletions};
use serde_json::json;

fn puller(remote: &MockRemote, store: &Arc<dyn DocumentStore>) -> Puller {
    let config = ReplicationConfig::new(remote.url.clone());
    Puller::new(config, Arc::clone(store), Arc::new(AcceptAll)).unwrap()
}

// =============================================================================
// Basic Pull
// =============================================================================

#[tokio::test]
async fn test_pull_into_empty_store() {
    let remote = MockRemote::start().await;
    remote.add_revision("plain", &["2-b", "1-a"], json!({"kind": "json"}));
    remote.add_multipart_revision(
        "with-file",
        &["1-m"],
        json!({"kind": "multipart"}),
        &[("photo.jpg", b"\xff\xd8 not really a jpeg")],
    );
    remote.add_deletion("gone", &["3-z", "2-y", "1-x"]);

    let store = memory_store();
    let blobs = BlobStore::new();
    let puller = puller(&remote, &store).with_blobs(blobs.clone());
    let summary = puller.run().await.unwrap();

    assert_eq!(summary.error, None);
    assert_eq!(summary.last_sequence, Some(json!(3)));
    assert_eq!(summary.metrics.changes_received, 3);
    assert_eq!(summary.metrics.revisions_inserted, 3);
    assert_eq!(summary.metrics.attachments_received, 1);
    assert_eq!(puller.status(), PullerStatus::Stopped { error: None });

    let plain = store.get("plain", None, true).unwrap();
    assert_eq!(plain.rev_id(), &rev("2-b"));
    assert_eq!(plain.body().unwrap()["kind"], json!("json"));
    let history: Vec<RevisionId> = store
        .revision_history("plain", &rev("2-b"))
        .iter()
        .map(|r| r.rev_id().clone())
        .collect();
    assert_eq!(history, vec![rev("2-b"), rev("1-a")]);

    let with_file = store.get("with-file", None, true).unwrap();
    let stub = &with_file.body().unwrap()["_attachments"]["photo.jpg"];
    let digest = blob_digest(b"\xff\xd8 not really a jpeg");
    assert_eq!(stub["digest"], json!(digest));
    assert!(blobs.contains(&digest));

    let gone = store.get("gone", None, false).unwrap();
    assert!(gone.is_deleted());
    assert_eq!(store.document_count(), 2);

    assert_eq!(puller.checkpoint().load(), Some(json!(3)));
}

/// Remote credentials in the URL are sent as basic auth, never in the URL.
#[tokio::test]
async fn test_pull_sends_basic_auth() {
    let remote = MockRemote::start().await;
    remote.add_revision("a", &["1-a"], json!({}));

    let mut url = remote.url.clone();
    url.set_username("user").unwrap();
    url.set_password(Some("pw")).unwrap();
    let store = memory_store();
    let puller = Puller::new(ReplicationConfig::new(url), Arc::clone(&store), Arc::new(AcceptAll)).unwrap();
    assert!(!puller.session().display_remote().contains("pw"));

    puller.run().await.unwrap();

    let auth = remote.state.authorization();
    assert_eq!(auth.len(), 2);
    assert!(auth.iter().all(|a| a.as_deref() == Some("Basic dXNlcjpwdw==")));
}

// =============================================================================
// Conflicts
// =============================================================================

/// A local edit and a remote edit of the same parent both stay as leaves.
#[tokio::test]
async fn test_concurrent_local_and_remote_edits() {
    let store = memory_store();
    let first = store
        .put_revision(Some("D"), None, props(json!({"a": 1})), false, false, &AcceptAll)
        .unwrap();
    let root = first.rev_id().clone();

    let remote = MockRemote::start().await;
    remote.add_revision("D", &["2-y", root.as_str()], json!({"a": "remote"}));

    let local = store
        .put_revision(Some("D"), Some(&root), props(json!({"a": 2})), false, false, &AcceptAll)
        .unwrap();
    puller(&remote, &store).run().await.unwrap();

    let leaves: HashSet<RevisionId> = store
        .all_revisions("D", true)
        .into_iter()
        .map(|r| r.rev_id().clone())
        .collect();
    assert_eq!(leaves, HashSet::from([rev("2-y"), local.rev_id().clone()]));

    let winner = std::cmp::max(rev("2-y"), local.rev_id().clone());
    assert_eq!(store.get("D", None, false).unwrap().rev_id(), &winner);
}

/// Revisions already held locally are skipped without a fetch.
#[tokio::test]
async fn test_present_revisions_are_skipped() {
    let store = memory_store();
    common::force(store.as_ref(), "a", &["1-a"]);

    let remote = MockRemote::start().await;
    remote.add_revision("a", &["1-a"], json!({}));
    remote.add_revision("b", &["1-b"], json!({}));

    let summary = puller(&remote, &store).run().await.unwrap();
    assert_eq!(summary.metrics.revisions_skipped, 1);
    assert_eq!(summary.metrics.revisions_inserted, 1);
    assert_eq!(remote.state.doc_requests(), 1);
}

// =============================================================================
// Checkpoints
// =============================================================================

#[tokio::test]
async fn test_second_pull_resumes_from_checkpoint() {
    let remote = MockRemote::start().await;
    remote.add_revision("a", &["1-a"], json!({}));
    remote.add_revision("b", &["1-b"], json!({}));

    let store = memory_store();
    puller(&remote, &store).run().await.unwrap();
    assert_eq!(remote.state.doc_requests(), 2);

    remote.add_revision("c", &["1-c"], json!({}));
    let second = puller(&remote, &store);
    assert_eq!(second.checkpoint().load(), Some(json!(2)));
    let summary = second.run().await.unwrap();

    assert_eq!(summary.metrics.changes_received, 1);
    assert_eq!(summary.last_sequence, Some(json!(3)));
    assert_eq!(remote.state.doc_requests(), 3);
    let queries = remote.state.changes_queries();
    assert_eq!(queries[1].get("since").map(String::as_str), Some("2"));
    assert_eq!(store.document_count(), 3);
}

/// A filtered pull keeps its own checkpoint.
#[tokio::test]
async fn test_doc_ids_filter() {
    let remote = MockRemote::start().await;
    remote.add_revision("a", &["1-a"], json!({}));
    remote.add_revision("b", &["1-b"], json!({}));

    let store = memory_store();
    let unfiltered = puller(&remote, &store);
    let mut config = ReplicationConfig::new(remote.url.clone());
    config.doc_ids = vec!["b".into()];
    let filtered = Puller::new(config, Arc::clone(&store), Arc::new(AcceptAll)).unwrap();
    assert_ne!(filtered.checkpoint().doc_id(), unfiltered.checkpoint().doc_id());

    filtered.run().await.unwrap();
    assert_eq!(store.document_ids(), vec!["b".to_string()]);
    let query = &remote.state.changes_queries()[0];
    assert_eq!(query.get("filter").map(String::as_str), Some("_doc_ids"));
    assert_eq!(query.get("doc_ids").map(String::as_str), Some(r#"["b"]"#));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_unfetchable_revision_does_not_stop_pull() {
    let remote = MockRemote::start().await;
    remote.add_unfetchable_change("missing", "1-m");
    remote.add_revision("ok", &["1-o"], json!({}));

    let store = memory_store();
    let summary = puller(&remote, &store).run().await.unwrap();

    assert_eq!(summary.error, None);
    assert_eq!(summary.metrics.fetch_failures, 1);
    assert_eq!(summary.metrics.revisions_inserted, 1);
    assert_eq!(store.document_ids(), vec!["ok".to_string()]);
}

#[tokio::test]
async fn test_validation_veto_is_counted() {
    let remote = MockRemote::start().await;
    remote.add_revision("kept", &["1-k"], json!({}));
    remote.add_deletion("deleted", &["2-d", "1-d"]);

    let store = memory_store();
    let config = ReplicationConfig::new(remote.url.clone());
    let puller = Puller::new(config, Arc::clone(&store), Arc::new(RejectDeletions)).unwrap();
    let summary = puller.run().await.unwrap();

    assert_eq!(summary.metrics.revisions_rejected, 1);
    assert_eq!(summary.metrics.revisions_inserted, 1);
    assert!(store.get("deleted", None, false).is_none());
}

#[tokio::test]
async fn test_feed_failure_ends_pull_with_error() {
    let remote = MockRemote::start().await;
    remote.fail_changes_with(500);

    let store = memory_store();
    let puller = puller(&remote, &store);
    let summary = puller.run().await.unwrap();

    let error = summary.error.unwrap();
    assert!(error.contains("500"), "{}", error);
    assert!(matches!(puller.status(), PullerStatus::Stopped { error: Some(_) }));
    assert!(puller.checkpoint().load().is_none());
}

// =============================================================================
// CLI Wiring
// =============================================================================

#[tokio::test]
async fn test_cli_pull_summary() {
    let remote = MockRemote::start().await;
    remote.add_revision("a", &["1-a"], json!({}));
    remote.add_revision("c", &["1-remote"], json!({}));

    let config = Config::parse(&json!({ "replication": { "remote": remote.url.as_str() } }).to_string()).unwrap();
    let store = memory_store();
    common::force(store.as_ref(), "c", &["1-local"]);

    let summary = pull_into(&config, Arc::clone(&store)).await.unwrap();
    let value = store_summary(store.as_ref(), &summary).unwrap();

    assert_eq!(value["documents"], json!(2));
    assert_eq!(value["conflicts"], json!(["c"]));
    assert_eq!(value["pull"]["metrics"]["revisions_inserted"], json!(2));
    assert_eq!(value["pull"]["error"], json!(null));
}
