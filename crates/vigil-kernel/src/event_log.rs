//! [`EventLog`] – bounded FIFO of [`SafetyEvent`]s.
//!
//! Every monitor and every escalation step appends here, so the log is the
//! audit trail a post-mortem reads back. Capacity is fixed at construction;
//! see [`EventLog::record`] for the (deliberately lossy) overflow policy.

use std::collections::VecDeque;

use tracing::warn;
use vigil_types::SafetyEvent;

/// Bounded safety-event FIFO.
///
/// # Example
///
/// ```
/// use vigil_kernel::EventLog;
///
/// let mut log = EventLog::new(64);
/// log.record("deadline miss: brake_ctrl", 1);
/// assert_eq!(log.len(), 1);
/// assert_eq!(log.events()[0].param, 1);
/// ```
pub struct EventLog {
    capacity: usize,
    entries: VecDeque<SafetyEvent>,
}

impl EventLog {
    /// Create an empty log holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append an event.
    ///
    /// Overflow policy: when the log is full, the *entire* queue is purged
    /// and the new event becomes the only entry. Under saturation this
    /// intentionally trades history for the most recent fault; the purge is
    /// itself visible because the log length collapses to one.
    pub fn record(&mut self, description: impl Into<String>, param: u64) -> &SafetyEvent {
        let event = SafetyEvent::new(description, param);
        if self.entries.len() >= self.capacity {
            warn!(
                dropped = self.entries.len(),
                "safety event log saturated; purging history"
            );
            self.entries.clear();
        }
        self.entries.push_back(event);
        // Just pushed, so the queue is non-empty.
        self.entries.back().unwrap()
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> Vec<SafetyEvent> {
        self.entries.iter().cloned().collect()
    }

    /// The most recent `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<SafetyEvent> {
        self.entries
            .iter()
            .skip(self.entries.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut log = EventLog::new(8);
        log.record("first", 1);
        log.record("second", 2);
        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].description, "first");
        assert_eq!(events[1].description, "second");
    }

    #[test]
    fn overflow_purges_everything_then_inserts() {
        let mut log = EventLog::new(3);
        log.record("a", 0);
        log.record("b", 1);
        log.record("c", 2);
        assert_eq!(log.len(), 3);

        // Fourth event hits the purge-all-then-insert policy.
        log.record("d", 3);
        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].description, "d");
    }

    #[test]
    fn log_refills_after_purge() {
        let mut log = EventLog::new(2);
        log.record("a", 0);
        log.record("b", 1);
        log.record("c", 2); // purge
        log.record("d", 3);
        assert_eq!(log.len(), 2);
        assert_eq!(log.events()[1].description, "d");
    }

    #[test]
    fn tail_returns_most_recent() {
        let mut log = EventLog::new(8);
        for i in 0..5 {
            log.record(format!("e{i}"), i);
        }
        let tail = log.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].description, "e3");
        assert_eq!(tail[1].description, "e4");
    }

    #[test]
    fn empty_log() {
        let log = EventLog::new(4);
        assert!(log.is_empty());
        assert!(log.events().is_empty());
    }
}
