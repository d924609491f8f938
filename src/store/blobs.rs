//! Attachment blob store
//!
//! Content-addressed: a blob's key is its digest, `sha1-<base64>`, the
//! same string CouchDB-compatible peers put in `_attachments.*.digest`.
//! Storing equal content twice stores it once. Writers also compute the
//! `md5-<base64>` digest CouchDB servers advertise, so either can be
//! checked against what a peer declared.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use md5::Md5;
use sha1::{Digest, Sha1};

/// Digest string for `data`.
pub fn blob_digest(data: &[u8]) -> String {
    format_digest(Sha1::digest(data).as_slice())
}

/// `md5-<base64>` digest string for `data`.
pub fn md5_digest(data: &[u8]) -> String {
    format!("md5-{}", STANDARD.encode(Md5::digest(data)))
}

fn format_digest(raw: &[u8]) -> String {
    format!("sha1-{}", STANDARD.encode(raw))
}

/// Shared, cloneable handle to attachment content.
#[derive(Clone, Debug, Default)]
pub struct BlobStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data`, returning its digest.
    pub fn put(&self, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let digest = blob_digest(&data);
        self.install(digest.clone(), data);
        digest
    }

    /// Fetch content by digest.
    pub fn get(&self, digest: &str) -> Option<Bytes> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start streaming a new blob.
    pub fn writer(&self) -> BlobWriter {
        BlobWriter {
            store: self.clone(),
            buffer: BytesMut::new(),
            hasher: Sha1::new(),
            md5: Md5::new(),
        }
    }

    fn install(&self, digest: String, data: Bytes) {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(digest)
            .or_insert(data);
    }
}

/// A blob written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReceipt {
    /// Store key, `sha1-<base64>`.
    pub digest: String,
    /// `md5-<base64>` of the same content.
    pub md5_digest: String,
    pub length: u64,
}

impl BlobReceipt {
    /// The receipt's digest in the same algorithm as `declared`, or
    /// `None` for an algorithm that is not computed.
    pub fn digest_like(&self, declared: &str) -> Option<&str> {
        if declared.starts_with("sha1-") {
            Some(&self.digest)
        } else if declared.starts_with("md5-") {
            Some(&self.md5_digest)
        } else {
            None
        }
    }
}

/// Incremental writer; content becomes visible in the store on `finish`.
#[derive(Debug)]
pub struct BlobWriter {
    store: BlobStore,
    buffer: BytesMut,
    hasher: Sha1,
    md5: Md5,
}

impl BlobWriter {
    pub fn append(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.md5.update(chunk);
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes written so far.
    pub fn length(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Digest of the bytes written so far.
    pub fn digest(&self) -> String {
        format_digest(self.hasher.clone().finalize().as_slice())
    }

    /// Install the content and return its digest and length.
    pub fn finish(self) -> BlobReceipt {
        let digest = format_digest(self.hasher.finalize().as_slice());
        let md5_digest = format!("md5-{}", STANDARD.encode(self.md5.finalize()));
        let length = self.buffer.len() as u64;
        self.store.install(digest.clone(), self.buffer.freeze());
        BlobReceipt {
            digest,
            md5_digest,
            length,
        }
    }
}
