//! Multipart revision bodies
//!
//! `reader` splits a `multipart/*` byte stream into parts; `assembler`
//! turns the parts of one document fetch into a revision document with
//! its attachments stored as blobs.

mod assembler;
mod errors;
mod reader;

pub use assembler::{AssembledRevision, AttachmentReceipt, MultipartRevisionAssembler};
pub use errors::MultipartError;
pub use reader::{boundary_from_content_type, MultipartReader, PartEvent, PartHeaders};
