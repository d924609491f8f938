//! revdb - an embedded multi-version document store with pull replication
//!
//! - `revision`: revision ids, revisions and their wire history
//! - `store`: the revision-tree document store
//! - `replication`: change feed, multipart fetch and ingest from a remote
//! - `observability`: structured logging, events and counters
//! - `cli`: the `revdb` binary's commands

pub mod cli;
pub mod observability;
pub mod replication;
pub mod revision;
pub mod store;
