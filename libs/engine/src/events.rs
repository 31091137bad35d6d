//! Boundary to external monitoring/digest aggregation
//!
//! Workflows push a lifecycle-trail snapshot after every invocation and
//! report terminal failures here. The transport behind this boundary is
//! out of scope; emission is best-effort and must never fail the
//! pipeline.

use crate::error::EngineError;
use crate::message::MessageMarker;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Receives lifecycle-trail events and terminal failures
pub trait EventAggregator: Send + Sync + std::fmt::Debug {
    fn record_trail(&self, message_id: &str, trail: &[MessageMarker]);

    fn record_terminal_failure(&self, message_id: &str, error: &EngineError);
}

/// Discards every event
#[derive(Debug, Default)]
pub struct NoOpAggregator;

impl EventAggregator for NoOpAggregator {
    fn record_trail(&self, _message_id: &str, _trail: &[MessageMarker]) {}

    fn record_terminal_failure(&self, _message_id: &str, _error: &EngineError) {}
}

/// Bounded in-memory aggregator, mostly useful for tests and embedding
#[derive(Debug)]
pub struct InMemoryAggregator {
    capacity: usize,
    trails: Mutex<VecDeque<(String, Vec<MessageMarker>)>>,
    failures: Mutex<VecDeque<(String, String)>>,
}

impl Default for InMemoryAggregator {
    fn default() -> Self {
        Self::with_capacity(1000)
    }
}

impl InMemoryAggregator {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            trails: Mutex::new(VecDeque::with_capacity(capacity)),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn trail_count(&self) -> usize {
        self.trails.lock().len()
    }

    pub fn trail_for(&self, message_id: &str) -> Option<Vec<MessageMarker>> {
        self.trails
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == message_id)
            .map(|(_, trail)| trail.clone())
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().iter().cloned().collect()
    }
}

impl EventAggregator for InMemoryAggregator {
    fn record_trail(&self, message_id: &str, trail: &[MessageMarker]) {
        let mut trails = self.trails.lock();
        if trails.len() >= self.capacity {
            trails.pop_front();
        }
        trails.push_back((message_id.to_string(), trail.to_vec()));
    }

    fn record_terminal_failure(&self, message_id: &str, error: &EngineError) {
        let mut failures = self.failures.lock();
        if failures.len() >= self.capacity {
            failures.pop_front();
        }
        failures.push_back((message_id.to_string(), error.to_string()));
    }
}
