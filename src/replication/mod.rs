//! Pull replication subsystem
//!
//! Brings revisions from a remote CouchDB-compatible database into the
//! local [`DocumentStore`](crate::store::DocumentStore):
//!
//! - `ChangeFeedReader` reads `_changes` on a background task
//! - `ReplicationIngestPipeline` skips known revisions and force-inserts
//!   the rest with their remote ancestry
//! - `MultipartRevisionAssembler` reassembles documents and attachments
//!   from streamed `multipart/related` bodies
//! - `Puller` runs all of it for one remote and keeps a checkpoint
//!
//! Remote revisions never fail because of a local conflict; conflicts are
//! kept as sibling leaves. Failures are per document except a terminal
//! feed failure or a fatal store error.

mod backoff;
mod change_entry;
mod change_feed;
mod checkpoint;
mod config;
mod errors;
mod fetcher;
mod ingest;
mod json_stream;
pub mod multipart;
mod puller;
mod session;

pub use backoff::{delay_for_attempt, Backoff};
pub use change_entry::{sequence_token, ChangeEntry};
pub use change_feed::{ChangeFeedClient, ChangeFeedOptions, ChangeFeedReader, FeedState};
pub use checkpoint::{checkpoint_id, Checkpoint};
pub use config::{BackoffConfig, Credentials, FeedMode, ReplicationConfig};
pub use errors::{ReplicationError, ReplicationResult};
pub use fetcher::{FetchedRevision, RevisionFetcher};
pub use ingest::{IngestOutcome, IngestReport, ReplicationIngestPipeline};
pub use json_stream::JsonArrayStream;
pub use multipart::{MultipartError, MultipartRevisionAssembler};
pub use puller::{PullSummary, Puller, PullerStatus};
pub use session::ReplicationSession;
