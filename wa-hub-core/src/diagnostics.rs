//! Per-instance diagnostics ring buffer backing `GET /instances/{id}/diagnostics`:
//! recent lifecycle events, watchdog anchors, and the last error, kept for
//! operator debugging.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

const MAX_EVENTS: usize = 50;

/// One observed lifecycle moment, kept for operator debugging.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

impl DiagnosticEvent {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

/// A capped, append-only log of recent events for one instance.
pub struct DiagnosticsLog {
    events: Mutex<VecDeque<DiagnosticEvent>>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    pub fn record(&self, event: DiagnosticEvent) {
        let mut events = self.events.lock();
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_max_events() {
        let log = DiagnosticsLog::new();
        for i in 0..(MAX_EVENTS + 10) {
            log.record(DiagnosticEvent::new("state", i.to_string()));
        }
        assert_eq!(log.snapshot().len(), MAX_EVENTS);
        assert_eq!(log.snapshot().first().unwrap().detail, "10");
    }
}
