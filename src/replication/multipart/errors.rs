//! Multipart framing and attachment errors
//!
//! Every variant fails a single document fetch; none stops the change feed.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("'{0}' is not a multipart content type")]
    NotMultipart(String),

    #[error("multipart content type has no boundary")]
    MissingBoundary,

    #[error("missing ':' in part header line '{0}'")]
    InvalidHeader(String),

    #[error("incomplete MIME multipart response")]
    Incomplete,

    #[error("document body is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("unsupported encoding '{0}'")]
    UnsupportedEncoding(String),

    #[error("attachment '{0}' does not appear in MIME body")]
    UnknownAttachment(String),

    #[error("attachment '{0}' has no digest metadata")]
    MissingDigest(String),

    #[error("attachment '{name}' digest mismatch: declared {declared}, received {actual}")]
    DigestMismatch {
        name: String,
        declared: String,
        actual: String,
    },

    #[error("attachment '{name}' length mismatch: declared {declared}, received {actual}")]
    LengthMismatch { name: String, declared: u64, actual: u64 },

    #[error("more MIME bodies ({bodies}) than attachments ({attachments})")]
    ExtraBodies { bodies: usize, attachments: usize },

    #[error("attachment '{0}' has invalid inline data")]
    InvalidInlineData(String),
}

impl MultipartError {
    pub fn code(&self) -> &'static str {
        match self {
            MultipartError::NotMultipart(_) => "REV_MULTIPART_NOT_MULTIPART",
            MultipartError::MissingBoundary => "REV_MULTIPART_MISSING_BOUNDARY",
            MultipartError::InvalidHeader(_) => "REV_MULTIPART_INVALID_HEADER",
            MultipartError::Incomplete => "REV_MULTIPART_INCOMPLETE",
            MultipartError::InvalidJson(_) => "REV_MULTIPART_INVALID_JSON",
            MultipartError::UnsupportedEncoding(_) => "REV_MULTIPART_UNSUPPORTED_ENCODING",
            MultipartError::UnknownAttachment(_) => "REV_MULTIPART_UNKNOWN_ATTACHMENT",
            MultipartError::MissingDigest(_) => "REV_MULTIPART_MISSING_DIGEST",
            MultipartError::DigestMismatch { .. } => "REV_MULTIPART_DIGEST_MISMATCH",
            MultipartError::LengthMismatch { .. } => "REV_MULTIPART_LENGTH_MISMATCH",
            MultipartError::ExtraBodies { .. } => "REV_MULTIPART_EXTRA_BODIES",
            MultipartError::InvalidInlineData(_) => "REV_MULTIPART_INVALID_INLINE_DATA",
        }
    }
}
