//! Ordered apply event log, shared by all actions of one apply cycle and
//! drained into the revision's apply log when the cycle settles.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    pub level: EventLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Thread-safe ordered event log. Entries are mirrored to `tracing` as they
/// arrive so operators see progress live, not only after the revision settles.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<EventEntry>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(EventLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(EventLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(EventLevel::Error, message.into());
    }

    fn push(&self, level: EventLevel, message: String) {
        match level {
            EventLevel::Info => info!(target: "verge::apply", "{}", message),
            EventLevel::Warn => warn!(target: "verge::apply", "{}", message),
            EventLevel::Error => error!(target: "verge::apply", "{}", message),
        }
        self.entries.lock().unwrap().push(EventEntry {
            level,
            message,
            at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes all accumulated entries, leaving the log empty.
    pub fn drain(&self) -> Vec<EventEntry> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_keep_order_and_drain_empties() {
        let log = EventLog::new();
        log.info("one");
        log.error("two");
        let entries = log.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "one");
        assert_eq!(entries[1].level, EventLevel::Error);
        assert!(log.is_empty());
    }
}
