//! Reassembles one fetched revision from a streamed response body
//!
//! A `multipart/*` body carries the revision's JSON first, then one part
//! per attachment marked `"follows": true`. Attachment parts stream into
//! the [`BlobStore`]; on `finish` each `_attachments` entry is matched to
//! a part by file name or digest and rewritten as a stub pointing at the
//! stored blob. Any other content type is parsed as a single JSON
//! document whose attachments, if any, are inline base64 `data`.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

use super::errors::MultipartError;
use super::reader::{MultipartReader, PartEvent, PartHeaders};
use crate::observability::{Event, Logger};
use crate::revision::Properties;
use crate::store::{BlobReceipt, BlobStore, BlobWriter};

/// An attachment whose content is now in the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentReceipt {
    pub name: String,
    pub digest: String,
    pub length: u64,
}

/// The assembled revision document.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledRevision {
    pub properties: Properties,
    pub attachments: Vec<AttachmentReceipt>,
}

enum CurrentPart {
    Json,
    Attachment {
        name: Option<String>,
        writer: BlobWriter,
    },
}

struct ReceivedPart {
    name: Option<String>,
    receipt: BlobReceipt,
}

/// Streaming assembler for one document fetch.
pub struct MultipartRevisionAssembler {
    blobs: BlobStore,
    reader: Option<MultipartReader>,
    json: Vec<u8>,
    parts_started: usize,
    current: Option<CurrentPart>,
    received: Vec<ReceivedPart>,
}

impl MultipartRevisionAssembler {
    /// Prepare for a body of `content_type`. Non-multipart types are
    /// buffered and parsed as JSON.
    pub fn new(content_type: &str, blobs: BlobStore) -> Result<Self, MultipartError> {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let reader = if media_type.starts_with("multipart/") {
            Some(MultipartReader::new(content_type)?)
        } else {
            None
        };
        Ok(Self {
            blobs,
            reader,
            json: Vec::new(),
            parts_started: 0,
            current: None,
            received: Vec::new(),
        })
    }

    pub fn is_multipart(&self) -> bool {
        self.reader.is_some()
    }

    /// Feed the next chunk of the response body.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), MultipartError> {
        let events = match self.reader.as_mut() {
            Some(reader) => reader.append(chunk)?,
            None => {
                self.json.extend_from_slice(chunk);
                return Ok(());
            }
        };
        for event in events {
            match event {
                PartEvent::Started(headers) => self.start_part(&headers)?,
                PartEvent::Data(data) => match self.current.as_mut() {
                    Some(CurrentPart::Json) => self.json.extend_from_slice(&data),
                    Some(CurrentPart::Attachment { writer, .. }) => writer.append(&data),
                    None => {}
                },
                PartEvent::Finished => self.finish_part(),
            }
        }
        Ok(())
    }

    fn start_part(&mut self, headers: &PartHeaders) -> Result<(), MultipartError> {
        if let Some(encoding) = headers.get("content-encoding") {
            if !encoding.eq_ignore_ascii_case("identity") {
                return Err(MultipartError::UnsupportedEncoding(encoding.clone()));
            }
        }
        self.parts_started += 1;
        let index = self.parts_started.to_string();
        Logger::trace(Event::MultipartPartStart.as_str(), &[("part", &index)]);

        self.current = Some(if self.parts_started == 1 {
            CurrentPart::Json
        } else {
            CurrentPart::Attachment {
                name: headers.get("content-disposition").and_then(|d| attachment_filename(d)),
                writer: self.blobs.writer(),
            }
        });
        Ok(())
    }

    fn finish_part(&mut self) {
        let index = self.parts_started.to_string();
        match self.current.take() {
            Some(CurrentPart::Attachment { name, writer }) => {
                let receipt = writer.finish();
                let length = receipt.length.to_string();
                Logger::trace(
                    Event::MultipartPartComplete.as_str(),
                    &[("part", &index), ("digest", &receipt.digest), ("length", &length)],
                );
                self.received.push(ReceivedPart { name, receipt });
            }
            Some(CurrentPart::Json) => {
                Logger::trace(Event::MultipartPartComplete.as_str(), &[("part", &index)]);
            }
            None => {}
        }
    }

    /// Verify attachments and return the document.
    pub fn finish(self) -> Result<AssembledRevision, MultipartError> {
        if let Some(reader) = &self.reader {
            if !reader.is_finished() || self.parts_started == 0 {
                return Err(MultipartError::Incomplete);
            }
        }

        let mut properties = match serde_json::from_slice::<Value>(&self.json) {
            Ok(Value::Object(properties)) => properties,
            Ok(_) => return Err(MultipartError::InvalidJson("expected an object".into())),
            Err(e) => return Err(MultipartError::InvalidJson(e.to_string())),
        };

        let attachments = register_attachments(&mut properties, &self.received, &self.blobs)?;
        Ok(AssembledRevision {
            properties,
            attachments,
        })
    }
}

/// File name from `attachment; filename="name"`.
fn attachment_filename(disposition: &str) -> Option<String> {
    let mut params = disposition.split(';').map(str::trim);
    if !params.next()?.eq_ignore_ascii_case("attachment") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let value = value.trim();
        Some(
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
                .to_string(),
        )
    })
}

fn register_attachments(
    properties: &mut Properties,
    received: &[ReceivedPart],
    blobs: &BlobStore,
) -> Result<Vec<AttachmentReceipt>, MultipartError> {
    let mut receipts = Vec::new();
    let Some(Value::Object(attachments)) = properties.get_mut("_attachments") else {
        if !received.is_empty() {
            return Err(MultipartError::ExtraBodies {
                bodies: received.len(),
                attachments: 0,
            });
        }
        return Ok(receipts);
    };

    let by_name: HashMap<&str, &BlobReceipt> = received
        .iter()
        .filter_map(|part| part.name.as_deref().map(|name| (name, &part.receipt)))
        .collect();
    let by_digest: HashMap<&str, &BlobReceipt> = received
        .iter()
        .flat_map(|part| {
            [
                (part.receipt.digest.as_str(), &part.receipt),
                (part.receipt.md5_digest.as_str(), &part.receipt),
            ]
        })
        .collect();
    let following = attachments
        .values()
        .filter(|meta| meta.get("follows").and_then(Value::as_bool) == Some(true))
        .count();

    for (name, meta) in attachments.iter_mut() {
        let Value::Object(meta) = meta else {
            continue;
        };
        if let Some(encoding) = meta.get("encoding").and_then(Value::as_str) {
            if !encoding.eq_ignore_ascii_case("identity") {
                return Err(MultipartError::UnsupportedEncoding(encoding.to_string()));
            }
        }
        let declared_digest = meta.get("digest").and_then(Value::as_str).map(str::to_string);

        let receipt = if meta.get("follows").and_then(Value::as_bool) == Some(true) {
            let part: &BlobReceipt = if let Some(part) = by_name.get(name.as_str()).copied() {
                part
            } else if let Some(digest) = &declared_digest {
                by_digest
                    .get(digest.as_str())
                    .copied()
                    .ok_or_else(|| MultipartError::UnknownAttachment(name.clone()))?
            } else if following == 1 && received.len() == 1 {
                &received[0].receipt
            } else {
                return Err(MultipartError::MissingDigest(name.clone()));
            };
            part.clone()
        } else if let Some(data) = meta.get("data").and_then(Value::as_str) {
            let bytes = STANDARD
                .decode(data)
                .map_err(|_| MultipartError::InvalidInlineData(name.clone()))?;
            let mut writer = blobs.writer();
            writer.append(&bytes);
            writer.finish()
        } else {
            continue;
        };

        if let Some(declared) = declared_digest {
            match receipt.digest_like(&declared) {
                Some(actual) if actual != declared => {
                    return Err(MultipartError::DigestMismatch {
                        name: name.clone(),
                        declared,
                        actual: actual.to_string(),
                    });
                }
                _ => {}
            }
        }
        let declared_length = meta
            .get("encoded_length")
            .or_else(|| meta.get("length"))
            .and_then(Value::as_u64);
        if let Some(declared) = declared_length {
            if declared != receipt.length {
                return Err(MultipartError::LengthMismatch {
                    name: name.clone(),
                    declared,
                    actual: receipt.length,
                });
            }
        }

        meta.remove("follows");
        meta.remove("data");
        meta.insert("stub".into(), Value::Bool(true));
        meta.insert("digest".into(), Value::String(receipt.digest.clone()));
        meta.insert("length".into(), Value::from(receipt.length));
        receipts.push(AttachmentReceipt {
            name: name.clone(),
            digest: receipt.digest,
            length: receipt.length,
        });
    }

    if following < received.len() {
        return Err(MultipartError::ExtraBodies {
            bodies: received.len(),
            attachments: following,
        });
    }
    Ok(receipts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{blob_digest, md5_digest};
    use serde_json::json;

    const CONTENT_TYPE: &str = "multipart/related; boundary=B";

    fn multipart(json: &Value, parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = b"--B\r\nContent-Type: application/json\r\n\r\n".to_vec();
        body.extend(serde_json::to_vec(json).unwrap());
        for (name, data) in parts {
            body.extend(
                format!("\r\n--B\r\nContent-Disposition: attachment; filename=\"{}\"\r\n\r\n", name)
                    .as_bytes(),
            );
            body.extend_from_slice(data);
        }
        body.extend(b"\r\n--B--");
        body
    }

    fn assemble(content_type: &str, body: &[u8], blobs: &BlobStore) -> Result<AssembledRevision, MultipartError> {
        let mut assembler = MultipartRevisionAssembler::new(content_type, blobs.clone())?;
        for chunk in body.chunks(7) {
            assembler.append(chunk)?;
        }
        assembler.finish()
    }

    #[test]
    fn test_plain_json_body() {
        let blobs = BlobStore::new();
        let doc = json!({"_id": "d", "_rev": "1-a", "n": 1});
        let out = assemble("application/json", &serde_json::to_vec(&doc).unwrap(), &blobs).unwrap();
        assert_eq!(Value::Object(out.properties), doc);
        assert!(out.attachments.is_empty());
    }

    #[test]
    fn test_attachment_matched_by_name() {
        let blobs = BlobStore::new();
        let doc = json!({
            "_id": "d",
            "_attachments": {"a.txt": {"follows": true, "content_type": "text/plain",
                                       "digest": blob_digest(b"hello"), "length": 5}}
        });
        let out = assemble(CONTENT_TYPE, &multipart(&doc, &[("a.txt", b"hello")]), &blobs).unwrap();
        assert_eq!(out.attachments.len(), 1);
        let meta = &out.properties["_attachments"]["a.txt"];
        assert_eq!(meta["stub"], true);
        assert!(meta.get("follows").is_none());
        assert_eq!(blobs.get(&out.attachments[0].digest).unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_attachment_matched_by_digest() {
        let blobs = BlobStore::new();
        let doc = json!({"_attachments": {"x": {"follows": true, "digest": blob_digest(b"abc")}}});
        let out = assemble(CONTENT_TYPE, &multipart(&doc, &[("other-name", b"abc")]), &blobs).unwrap();
        assert_eq!(out.attachments[0].name, "x");
    }

    #[test]
    fn test_single_attachment_without_digest() {
        let blobs = BlobStore::new();
        let doc = json!({"_attachments": {"x": {"follows": true}}});
        let out = assemble(CONTENT_TYPE, &multipart(&doc, &[("unnamed", b"abc")]), &blobs).unwrap();
        assert_eq!(out.properties["_attachments"]["x"]["digest"], blob_digest(b"abc"));
        assert_eq!(out.properties["_attachments"]["x"]["length"], 3);
    }

    #[test]
    fn test_digest_and_length_mismatches() {
        let blobs = BlobStore::new();
        let doc = json!({"_attachments": {"a": {"follows": true, "digest": blob_digest(b"zzz")}}});
        let err = assemble(CONTENT_TYPE, &multipart(&doc, &[("a", b"abc")]), &blobs).unwrap_err();
        assert_eq!(err.code(), "REV_MULTIPART_DIGEST_MISMATCH");

        let doc = json!({"_attachments": {"a": {"follows": true, "length": 10}}});
        let err = assemble(CONTENT_TYPE, &multipart(&doc, &[("a", b"abc")]), &blobs).unwrap_err();
        assert_eq!(err.code(), "REV_MULTIPART_LENGTH_MISMATCH");
    }

    #[test]
    fn test_md5_digests_are_checked() {
        let blobs = BlobStore::new();
        let doc = json!({"_attachments": {"a": {"follows": true, "digest": md5_digest(b"hello")}}});
        let out = assemble(CONTENT_TYPE, &multipart(&doc, &[("a", b"hello")]), &blobs).unwrap();
        assert_eq!(out.properties["_attachments"]["a"]["digest"], blob_digest(b"hello"));

        let doc = json!({"_attachments": {"a": {"follows": true, "digest": "md5-AAAAAAAAAAAAAAAAAAAAAA=="}}});
        let err = assemble(CONTENT_TYPE, &multipart(&doc, &[("a", b"hello")]), &blobs).unwrap_err();
        assert!(matches!(err, MultipartError::DigestMismatch { .. }));
    }

    #[test]
    fn test_unnamed_part_matched_by_md5() {
        let blobs = BlobStore::new();
        let doc = json!({"_attachments": {
            "x": {"follows": true, "digest": md5_digest(b"abc")},
            "y": {"follows": true, "digest": md5_digest(b"def")},
        }});
        let body = multipart(&doc, &[("p1", b"def"), ("p2", b"abc")]);
        let out = assemble(CONTENT_TYPE, &body, &blobs).unwrap();
        assert_eq!(out.properties["_attachments"]["x"]["digest"], blob_digest(b"abc"));
        assert_eq!(out.properties["_attachments"]["y"]["digest"], blob_digest(b"def"));
    }

    #[test]
    fn test_unknown_and_extra_bodies() {
        let blobs = BlobStore::new();
        let doc = json!({"_attachments": {"a": {"follows": true, "digest": blob_digest(b"nope")}}});
        let err = assemble(CONTENT_TYPE, &multipart(&doc, &[("b", b"abc")]), &blobs).unwrap_err();
        assert_eq!(err, MultipartError::UnknownAttachment("a".into()));

        let doc = json!({"_attachments": {"a": {"follows": true}}});
        let err = assemble(CONTENT_TYPE, &multipart(&doc, &[("a", b"1"), ("b", b"2")]), &blobs)
            .unwrap_err();
        assert_eq!(err, MultipartError::ExtraBodies { bodies: 2, attachments: 1 });
    }

    #[test]
    fn test_truncated_multipart_is_incomplete() {
        let blobs = BlobStore::new();
        let body = multipart(&json!({"_id": "d"}), &[]);
        let err = assemble(CONTENT_TYPE, &body[..body.len() - 4], &blobs).unwrap_err();
        assert_eq!(err, MultipartError::Incomplete);
    }

    #[test]
    fn test_inline_data_becomes_stub() {
        let blobs = BlobStore::new();
        let doc = json!({"_attachments": {"i": {"data": STANDARD.encode(b"inline"), "content_type": "text/plain"}}});
        let out = assemble("application/json", &serde_json::to_vec(&doc).unwrap(), &blobs).unwrap();
        let meta = &out.properties["_attachments"]["i"];
        assert!(meta.get("data").is_none());
        assert_eq!(meta["stub"], true);
        assert_eq!(meta["length"], 6);
        assert!(blobs.contains(&blob_digest(b"inline")));
    }

    #[test]
    fn test_encoded_parts_are_rejected() {
        let blobs = BlobStore::new();
        let doc = json!({"_attachments": {"a": {"follows": true, "encoding": "gzip"}}});
        let err = assemble(CONTENT_TYPE, &multipart(&doc, &[("a", b"x")]), &blobs).unwrap_err();
        assert_eq!(err, MultipartError::UnsupportedEncoding("gzip".into()));
    }

    #[test]
    fn test_filename_parsing() {
        assert_eq!(attachment_filename("attachment; filename=\"a b.txt\""), Some("a b.txt".into()));
        assert_eq!(attachment_filename("attachment; filename=plain"), Some("plain".into()));
        assert_eq!(attachment_filename("inline; filename=x"), None);
    }
}
