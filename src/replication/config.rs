//! Replication configuration
//!
//! Fixed for the lifetime of a pull; changing any field means stopping the
//! session and starting a new one.

use std::collections::BTreeMap;

use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::errors::{ReplicationError, ReplicationResult};

/// How the change feed is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// One request; stop at the end of the response.
    #[default]
    OneShot,
    /// The server holds each request until there are changes; re-request
    /// immediately after each response.
    LongPoll,
    /// One connection streaming changes indefinitely.
    Continuous,
}

impl FeedMode {
    /// Value of the `feed` query parameter.
    pub fn feed_param(&self) -> &'static str {
        match self {
            FeedMode::OneShot => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

/// Retry delays for the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay after a failure (default: 2000)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Cap on the delay (default: 300000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Basic-auth credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"---")
            .finish()
    }
}

/// Pull replication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Remote database URL, e.g. `http://host:5984/db`
    pub remote: Url,

    /// Feed mode (default: one_shot)
    #[serde(default)]
    pub mode: FeedMode,

    /// Keep pulling after catching up; upgrades one_shot to long_poll (default: false)
    #[serde(default)]
    pub continuous: bool,

    /// Server-side filter function name
    #[serde(default)]
    pub filter: Option<String>,

    /// Parameters passed to the filter
    #[serde(default)]
    pub filter_params: BTreeMap<String, Value>,

    /// Restrict the feed to these documents
    #[serde(default)]
    pub doc_ids: Vec<String>,

    /// Report every leaf revision, not only the winner (default: false)
    #[serde(default)]
    pub include_conflicts: bool,

    /// Entries per long-poll request (default: 50)
    #[serde(default = "default_long_poll_limit")]
    pub long_poll_limit: u32,

    /// Server heartbeat interval (default: 300000)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Timeout for document fetches; the feed itself has none
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Credentials; taken from the URL user-info when absent
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_long_poll_limit() -> u32 {
    50
}

fn default_heartbeat_ms() -> u64 {
    300_000
}

impl ReplicationConfig {
    /// A one-shot pull from `remote` with every other field defaulted.
    pub fn new(remote: Url) -> Self {
        Self {
            remote,
            mode: FeedMode::default(),
            continuous: false,
            filter: None,
            filter_params: BTreeMap::new(),
            doc_ids: Vec::new(),
            include_conflicts: false,
            long_poll_limit: default_long_poll_limit(),
            heartbeat_ms: default_heartbeat_ms(),
            backoff: BackoffConfig::default(),
            request_timeout_ms: None,
            credentials: None,
            headers: BTreeMap::new(),
        }
    }

    /// The feed mode actually used.
    pub fn effective_mode(&self) -> FeedMode {
        match self.mode {
            FeedMode::OneShot if self.continuous => FeedMode::LongPoll,
            mode => mode,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ReplicationResult<()> {
        if !matches!(self.remote.scheme(), "http" | "https") {
            return Err(ReplicationError::config(format!(
                "unsupported remote scheme '{}'",
                self.remote.scheme()
            )));
        }
        if self.remote.cannot_be_a_base() {
            return Err(ReplicationError::config("remote URL cannot be a base"));
        }
        if self.long_poll_limit == 0 {
            return Err(ReplicationError::config("long_poll_limit must be at least 1"));
        }
        if self.heartbeat_ms == 0 {
            return Err(ReplicationError::config("heartbeat_ms must be at least 1"));
        }
        if self.backoff.min_delay_ms == 0 || self.backoff.min_delay_ms > self.backoff.max_delay_ms {
            return Err(ReplicationError::config(
                "backoff requires 0 < min_delay_ms <= max_delay_ms",
            ));
        }
        if self.filter.is_some() && !self.doc_ids.is_empty() {
            return Err(ReplicationError::config(
                "filter and doc_ids cannot be combined",
            ));
        }
        if !self.filter_params.is_empty() && self.filter.is_none() {
            return Err(ReplicationError::config("filter_params given without a filter"));
        }
        for name in self.headers.keys() {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(ReplicationError::config(format!("invalid header name '{}'", name)));
            }
        }
        Ok(())
    }
}
