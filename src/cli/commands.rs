//! CLI command implementations
//!
//! `pull` opens the configured store, runs one pull until the feed ends
//! (or Ctrl-C for continuous modes) and prints what landed locally. `check-config` only validates.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::observability::{log_event, mask_credentials, Event};
use crate::replication::{PullSummary, Puller, ReplicationConfig};
use crate::store::{open_store, AcceptAll, DocumentStore, StoreConfig};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local store (optional, all defaults)
    #[serde(default)]
    pub store: StoreConfig,

    /// Remote to pull from (required)
    pub replication: ReplicationConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;
        let config = Self::parse(&content)?;
        log_event(
            Event::ConfigLoaded,
            &[
                ("path", &path.display().to_string()),
                ("remote", &mask_credentials(config.replication.remote.as_str())),
            ],
        );
        Ok(config)
    }

    /// Parse and validate configuration JSON
    pub fn parse(content: &str) -> CliResult<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CliResult<()> {
        self.store.validate()?;
        self.replication.validate()?;
        Ok(())
    }

    /// The configuration as JSON with credentials masked.
    pub fn masked(&self) -> CliResult<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(remote) = value.pointer_mut("/replication/remote") {
            *remote = Value::String(mask_credentials(self.replication.remote.as_str()));
        }
        if let Some(password) = value.pointer_mut("/replication/credentials/password") {
            *password = Value::String("---".into());
        }
        Ok(value)
    }
}

/// Run a parsed command.
pub fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Pull { config } => pull(&config),
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Validate a configuration file and echo it.
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    write_response(json!({
        "valid": true,
        "config": config.masked()?,
    }))
}

/// Pull the configured remote and print a summary.
pub fn pull(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::runtime_error(e.to_string()))?;

    let store = open_store(&config.store, None)?;
    let summary = runtime.block_on(pull_into(&config, Arc::clone(&store)))?;
    let error = summary.error.clone();

    write_response(store_summary(store.as_ref(), &summary)?)?;
    match error {
        Some(message) => Err(CliError::replication_failed(message)),
        None => Ok(()),
    }
}

/// Run one pull of `config.replication` into `store`. Ctrl-C stops a
/// long-poll or continuous pull.
pub async fn pull_into(config: &Config, store: Arc<dyn DocumentStore>) -> CliResult<PullSummary> {
    let puller = Puller::new(config.replication.clone(), store, Arc::new(AcceptAll))?;
    let run = puller.run();
    tokio::pin!(run);
    tokio::select! {
        summary = &mut run => return Ok(summary?),
        Ok(()) = tokio::signal::ctrl_c() => puller.stop(),
    }
    Ok(run.await?)
}

/// What the store holds after a pull.
pub fn store_summary(store: &dyn DocumentStore, summary: &PullSummary) -> CliResult<Value> {
    let ids = store.document_ids();
    let conflicts: Vec<&String> = ids
        .iter()
        .filter(|id| {
            store
                .all_revisions(id, true)
                .iter()
                .filter(|rev| !rev.is_deleted())
                .count()
                > 1
        })
        .collect();
    Ok(json!({
        "documents": store.document_count(),
        "document_ids": ids,
        "conflicts": conflicts,
        "last_sequence": store.last_sequence(),
        "pull": serde_json::to_value(summary)?,
    }))
}
