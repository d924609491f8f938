//! ObservationScope for start/complete logging of long operations
//!
//! - Logs `{EVENT}_BEGIN` on creation
//! - Logs `{EVENT}_COMPLETE` with `elapsed_ms` on `complete()`
//! - Logs `{EVENT}_FAILED` on `fail()`
//! - Logs `{EVENT}_INCOMPLETE` if dropped without either

use std::time::Instant;

use super::events::Event;
use super::logger::Logger;

/// A scope that logs the begin and end of an operation.
///
/// ```ignore
/// let scope = ObservationScope::new(Event::Compaction, &[("docs", "12")]);
/// let pruned = tree.prune(depth);
/// scope.complete(&[("pruned", &pruned.to_string())]);
/// ```
pub struct ObservationScope {
    event: Event,
    started: Instant,
    fields: Vec<(&'static str, String)>,
    finished: bool,
}

impl ObservationScope {
    /// Open a scope, logging `{event}_BEGIN` with `fields`.
    pub fn new(event: Event, fields: &[(&'static str, &str)]) -> Self {
        Logger::info(&format!("{}_BEGIN", event.as_str()), fields);
        Self {
            event,
            started: Instant::now(),
            fields: fields.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            finished: false,
        }
    }

    /// Milliseconds since the scope was opened.
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Close the scope successfully.
    pub fn complete(mut self, extra: &[(&str, &str)]) {
        self.finished = true;
        let elapsed = self.elapsed_ms().to_string();
        let mut fields: Vec<(&str, &str)> =
            self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect();
        fields.extend(extra.iter().copied());
        fields.push(("elapsed_ms", &elapsed));
        Logger::info(&format!("{}_COMPLETE", self.event.as_str()), &fields);
    }

    /// Close the scope with a failure reason.
    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        let elapsed = self.elapsed_ms().to_string();
        Logger::error(
            &format!("{}_FAILED", self.event.as_str()),
            &[("reason", reason), ("elapsed_ms", &elapsed)],
        );
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.finished {
            Logger::warn(
                &format!("{}_INCOMPLETE", self.event.as_str()),
                &[("reason", "scope dropped without completion")],
            );
        }
    }
}
