//! Observability subsystem
//!
//! - Structured JSON logging with credential masking
//! - Typed lifecycle events
//! - Start/complete scopes for long operations
//! - Lock-free replication counters
//!
//! Observability is read-only: nothing here influences store or
//! replication behavior, and a failed log write is ignored.

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{mask_credentials, Logger, Severity};
pub use metrics::{MetricsSnapshot, ReplicationMetrics};
pub use scope::ObservationScope;

/// Log a lifecycle event with fields at its natural severity.
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    let severity = if event.is_fatal() {
        Severity::Fatal
    } else {
        Severity::Info
    };
    Logger::log(severity, event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::StoreOpened, &[("backend", "memory")]);
        log_event(Event::RevisionInternalError, &[("doc_id", "a")]);
    }
}
