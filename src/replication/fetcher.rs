//! Fetch one revision from the remote database
//!
//! `GET <db>/<doc>?rev=<rev>&revs=true&attachments=true` accepting either a
//! multipart or a plain JSON body. The body streams through the
//! [`MultipartRevisionAssembler`]; the revision's ancestry comes from the
//! `_revisions` property.

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;

use super::errors::{ReplicationError, ReplicationResult};
use super::multipart::{AttachmentReceipt, MultipartRevisionAssembler};
use super::session::ReplicationSession;
use crate::observability::mask_credentials;
use crate::revision::{parse_revision_history, Properties, Revision, RevisionId};
use crate::store::BlobStore;

/// A fetched revision ready for `force_insert`.
#[derive(Debug, Clone)]
pub struct FetchedRevision {
    pub revision: Revision,
    /// The revision's id followed by its ancestors, newest first.
    pub history: Vec<RevisionId>,
    pub attachments: Vec<AttachmentReceipt>,
}

impl FetchedRevision {
    /// Build from an assembled document, checking it is the revision that
    /// was asked for.
    pub fn from_document(
        doc_id: &str,
        rev_id: &RevisionId,
        document: Properties,
        attachments: Vec<AttachmentReceipt>,
    ) -> ReplicationResult<Self> {
        let history = parse_revision_history(&document);
        if history.first() != Some(rev_id) {
            return Err(ReplicationError::malformed(format!(
                "revision {} of {} has no matching _revisions history",
                rev_id, doc_id
            )));
        }
        let revision = Revision::from_document(document).ok_or_else(|| {
            ReplicationError::malformed(format!("revision {} of {} lacks _id or _rev", rev_id, doc_id))
        })?;
        if revision.doc_id() != doc_id || revision.rev_id() != rev_id {
            return Err(ReplicationError::malformed(format!(
                "asked for {} {} but received {} {}",
                doc_id,
                rev_id,
                revision.doc_id(),
                revision.rev_id()
            )));
        }
        Ok(Self {
            revision,
            history,
            attachments,
        })
    }
}

/// Fetches revisions into a shared blob store.
#[derive(Clone)]
pub struct RevisionFetcher {
    session: Arc<ReplicationSession>,
    blobs: BlobStore,
}

impl RevisionFetcher {
    pub fn new(session: Arc<ReplicationSession>, blobs: BlobStore) -> Self {
        Self { session, blobs }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Fetch `rev_id` of `doc_id`. Cancelling abandons the request with
    /// [`ReplicationError::Stopped`].
    pub async fn fetch(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
        cancel: &CancellationToken,
    ) -> ReplicationResult<FetchedRevision> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ReplicationError::Stopped),
            fetched = self.fetch_inner(doc_id, rev_id) => fetched,
        }
    }

    async fn fetch_inner(&self, doc_id: &str, rev_id: &RevisionId) -> ReplicationResult<FetchedRevision> {
        let url = self.session.url_for(
            &[doc_id],
            &[
                ("rev", rev_id.as_str()),
                ("revs", "true"),
                ("attachments", "true"),
            ],
        )?;

        let mut request = self
            .session
            .get(url.clone())
            .header(ACCEPT, "multipart/related, application/json");
        if let Some(timeout) = self.session.request_timeout() {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReplicationError::HttpStatus {
                status: status.as_u16(),
                url: mask_credentials(url.as_str()),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let mut assembler = MultipartRevisionAssembler::new(&content_type, self.blobs.clone())?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ReplicationError::Interrupted(e.to_string()))?;
            assembler.append(&chunk)?;
        }
        let assembled = assembler.finish()?;

        FetchedRevision::from_document(doc_id, rev_id, assembled.properties, assembled.attachments)
    }
}
