//! Error handling scopes
//!
//! Each scope (workflow, channel, adapter) may carry its own handler.
//! Terminal handling marks the message failed, signals the failure
//! callback, and either escalates to a parent scope or records into the
//! shared [`FailureDigest`]. A parent configured with `always_handle`
//! also processes messages a narrower handler already handled, enabling
//! layered behavior (immediate protocol response at the workflow scope,
//! durable persistence at the adapter scope).

use crate::context::Envelope;
use crate::events::{EventAggregator, NoOpAggregator};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

/// A failure-handling scope
#[async_trait]
pub trait ErrorHandler: Send + Sync + std::fmt::Debug {
    /// Handle a failed message
    ///
    /// The handler owns the envelope; deferring handlers (retry) keep it
    /// until a verdict is reached, terminal handlers mark it failed
    /// immediately.
    async fn handle(&self, envelope: Envelope);

    /// Whether this handler also processes messages a narrower handler
    /// already handled
    fn always_handle(&self) -> bool {
        false
    }

    /// Accept work again; called when the owning component starts.
    /// Stopped components may be restarted, so handlers that latch shut
    /// in [`shutdown`](Self::shutdown) re-open here.
    async fn activate(&self) {}

    /// Cancel any deferred work; called when the owning component stops
    async fn shutdown(&self) {}
}

/// One terminal failure, as remembered by the digest
#[derive(Debug, Clone)]
pub struct DigestEntry {
    pub message_id: String,
    pub workflow_id: Option<String>,
    pub error: String,
    pub timestamp: SystemTime,
}

/// Bounded ring of the most recent terminal failures
#[derive(Debug)]
pub struct FailureDigest {
    capacity: usize,
    entries: Mutex<VecDeque<DigestEntry>>,
}

impl Default for FailureDigest {
    fn default() -> Self {
        Self::with_capacity(100)
    }
}

impl FailureDigest {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, envelope: &Envelope) {
        let entry = DigestEntry {
            message_id: envelope.message.id().to_string(),
            workflow_id: envelope.context.workflow_id().map(String::from),
            error: envelope
                .context
                .failure()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown failure".to_string()),
            timestamp: SystemTime::now(),
        };
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<DigestEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.message_id == message_id)
    }
}

/// Terminal handler: fail the message, then escalate or digest
#[derive(Debug)]
pub struct StandardErrorHandler {
    name: String,
    parent: Option<Arc<dyn ErrorHandler>>,
    digest: Arc<FailureDigest>,
    aggregator: Arc<dyn EventAggregator>,
    always_handle: bool,
}

impl StandardErrorHandler {
    pub fn new(name: impl Into<String>, digest: Arc<FailureDigest>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            digest,
            aggregator: Arc::new(NoOpAggregator),
            always_handle: false,
        }
    }

    pub fn with_parent(mut self, parent: Arc<dyn ErrorHandler>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn EventAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_always_handle(mut self, always_handle: bool) -> Self {
        self.always_handle = always_handle;
        self
    }
}

#[async_trait]
impl ErrorHandler for StandardErrorHandler {
    async fn handle(&self, mut envelope: Envelope) {
        tracing::warn!(
            handler = %self.name,
            message_id = envelope.message.id(),
            workflow = ?envelope.context.workflow_id(),
            error = ?envelope.context.failure().map(|e| e.to_string()),
            "message failed terminally"
        );
        envelope.mark_failed();
        if let Some(error) = envelope.context.failure() {
            self.aggregator
                .record_terminal_failure(envelope.message.id(), error);
        }

        match &self.parent {
            Some(parent) if parent.always_handle() => parent.handle(envelope.clone()).await,
            Some(_) => {}
            // No parent scope registered: report into the shared digest.
            None => self.digest.record(&envelope),
        }
    }

    fn always_handle(&self) -> bool {
        self.always_handle
    }
}
