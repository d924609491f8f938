//! Store configuration and construction
//!
//! `open_store` is the single place a backend is chosen. Callers hold an
//! `Arc<dyn DocumentStore>` and never switch on the concrete type.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::{StoreError, StoreResult};
use super::memory::MemoryStore;
use super::notify::ChangeObserver;
use super::DocumentStore;
use crate::observability::{log_event, Event};

/// Available storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local, non-persistent.
    #[default]
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to construct (default: memory)
    #[serde(default)]
    pub backend: StoreBackend,

    /// Generations of ancestry kept by compaction (default: 20)
    #[serde(default = "default_max_rev_tree_depth")]
    pub max_rev_tree_depth: u64,

    /// Prune a document's tree as soon as it grows past the depth (default: false)
    #[serde(default)]
    pub auto_compact: bool,
}

fn default_max_rev_tree_depth() -> u64 {
    20
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            max_rev_tree_depth: default_max_rev_tree_depth(),
            auto_compact: false,
        }
    }
}

impl StoreConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_rev_tree_depth == 0 {
            return Err(StoreError::Config(
                "max_rev_tree_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Construct the configured store.
///
/// `observer` receives a [`DocumentChange`](super::DocumentChange) for every
/// committed revision.
pub fn open_store(
    config: &StoreConfig,
    observer: Option<Arc<dyn ChangeObserver>>,
) -> StoreResult<Arc<dyn DocumentStore>> {
    config.validate()?;
    let store: Arc<dyn DocumentStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.clone(), observer)),
    };
    log_event(
        Event::StoreOpened,
        &[
            ("backend", config.backend.as_str()),
            ("max_rev_tree_depth", &config.max_rev_tree_depth.to_string()),
        ],
    );
    Ok(store)
}
