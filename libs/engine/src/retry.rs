//! Retry-capable error handling
//!
//! Failed messages are held (the scheduler keeps the same envelope until
//! a verdict) and resubmitted into the workflow that first consumed them
//! after a configured interval, up to a retry limit. The retry counter
//! rides in the in-process context, never in metadata, so it cannot leak
//! across a produce/encode boundary. On shutdown every outstanding
//! resubmission is cancelled and its message failed immediately; nothing
//! stays pending past shutdown, and the handler re-opens when its owning
//! workflow starts again.

use crate::context::Envelope;
use crate::error::EngineError;
use crate::events::{EventAggregator, NoOpAggregator};
use crate::handler::{ErrorHandler, FailureDigest};
use crate::lifecycle::Component;
use crate::registry::WorkflowRegistry;
use crate::workflow::Workflow;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum scheduled retries before a message fails terminally;
    /// `None` retries forever
    pub retry_limit: Option<u32>,
    /// Delay before a failed message re-enters its workflow
    pub retry_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_limit: Some(10),
            retry_interval: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.retry_interval.is_zero() {
            return Err(EngineError::invalid_config(
                "retry interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RetryEntry {
    envelope: Envelope,
    // None only in the window between registering the entry and spawning
    // its timer task.
    handle: Option<JoinHandle<()>>,
    retry_count: u32,
}

/// Error handler that resubmits failed messages on a schedule
#[derive(Debug)]
pub struct RetryErrorHandler {
    name: String,
    config: RetryConfig,
    registry: WorkflowRegistry,
    pending: Arc<DashMap<String, RetryEntry>>,
    parent: Option<Arc<dyn ErrorHandler>>,
    digest: Arc<FailureDigest>,
    aggregator: Arc<dyn EventAggregator>,
    accepting: Arc<AtomicBool>,
    always_handle: bool,
}

impl RetryErrorHandler {
    pub fn new(
        name: impl Into<String>,
        config: RetryConfig,
        registry: WorkflowRegistry,
        digest: Arc<FailureDigest>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            registry,
            pending: Arc::new(DashMap::new()),
            parent: None,
            digest,
            aggregator: Arc::new(NoOpAggregator),
            accepting: Arc::new(AtomicBool::new(true)),
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

    /// Number of messages currently waiting for resubmission
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn resubmit(
        envelope: Envelope,
        message_id: String,
        interval: Duration,
        pending: Arc<DashMap<String, RetryEntry>>,
        registry: WorkflowRegistry,
        parent: Option<Arc<dyn ErrorHandler>>,
        digest: Arc<FailureDigest>,
        aggregator: Arc<dyn EventAggregator>,
    ) {
        tokio::time::sleep(interval).await;

        // Already removed means shutdown cancelled this retry.
        if pending.remove(&message_id).is_none() {
            return;
        }

        let workflow_id = envelope.context.workflow_id().map(str::to_string);
        let target = workflow_id.as_deref().and_then(|id| registry.lookup(id));
        match target {
            Some(shared) => {
                let mut workflow = shared.lock().await;
                if workflow.state().is_started() {
                    tracing::info!(
                        message_id = %message_id,
                        workflow = ?workflow_id,
                        attempt = envelope.context.retry_count(),
                        "resubmitting message"
                    );
                    workflow.on_message(envelope).await;
                } else {
                    drop(workflow);
                    tracing::warn!(
                        message_id = %message_id,
                        workflow = ?workflow_id,
                        "target workflow not started, failing message"
                    );
                    fail_terminally(envelope, &parent, &digest, &aggregator).await;
                }
            }
            None => {
                tracing::warn!(
                    message_id = %message_id,
                    workflow = ?workflow_id,
                    "target workflow not registered, failing message"
                );
                fail_terminally(envelope, &parent, &digest, &aggregator).await;
            }
        }
    }
}

#[async_trait]
impl ErrorHandler for RetryErrorHandler {
    async fn handle(&self, mut envelope: Envelope) {
        if !self.accepting.load(Ordering::Acquire) {
            fail_terminally(envelope, &self.parent, &self.digest, &self.aggregator).await;
            return;
        }

        let attempts = envelope.context.retry_count();
        let within_limit = self.config.retry_limit.map_or(true, |limit| attempts < limit);
        if !within_limit {
            tracing::warn!(
                handler = %self.name,
                message_id = envelope.message.id(),
                attempts,
                "retry limit reached"
            );
            fail_terminally(envelope, &self.parent, &self.digest, &self.aggregator).await;
            return;
        }

        envelope.context.increment_retry();
        let message_id = envelope.message.id().to_string();
        tracing::info!(
            handler = %self.name,
            message_id = %message_id,
            attempt = envelope.context.retry_count(),
            delay = ?self.config.retry_interval,
            "scheduling retry"
        );

        // Register the entry before spawning the timer task. The task
        // treats a missing entry as a cancelled retry, so the entry must
        // be visible before the interval can possibly elapse.
        let scheduled_attempt = envelope.context.retry_count();
        let entry = RetryEntry {
            retry_count: scheduled_attempt,
            envelope: envelope.clone(),
            handle: None,
        };
        if let Some(stale) = self.pending.insert(message_id.clone(), entry) {
            if let Some(stale_handle) = stale.handle {
                stale_handle.abort();
            }
        }

        let handle = tokio::spawn(Self::resubmit(
            envelope,
            message_id.clone(),
            self.config.retry_interval,
            self.pending.clone(),
            self.registry.clone(),
            self.parent.clone(),
            self.digest.clone(),
            self.aggregator.clone(),
        ));
        // The timer may already have consumed the entry, or a faster
        // rescheduling may have replaced it; attach the handle only to
        // the attempt that spawned it.
        if let Some(mut entry) = self.pending.get_mut(&message_id) {
            if entry.handle.is_none() && entry.retry_count == scheduled_attempt {
                entry.handle = Some(handle);
            }
        }
    }

    fn always_handle(&self) -> bool {
        self.always_handle
    }

    /// Re-open the handler when its owning workflow starts; a previous
    /// shutdown latches new work out until then
    async fn activate(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    /// Cancel every outstanding resubmission and fail its message now
    async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                tracing::warn!(
                    handler = %self.name,
                    message_id = %id,
                    attempt = entry.retry_count,
                    "cancelling scheduled retry at shutdown"
                );
                fail_terminally(entry.envelope, &self.parent, &self.digest, &self.aggregator)
                    .await;
            }
        }
    }
}

async fn fail_terminally(
    mut envelope: Envelope,
    parent: &Option<Arc<dyn ErrorHandler>>,
    digest: &FailureDigest,
    aggregator: &Arc<dyn EventAggregator>,
) {
    envelope.mark_failed();
    if let Some(error) = envelope.context.failure() {
        aggregator.record_terminal_failure(envelope.message.id(), error);
    }
    match parent {
        Some(p) if p.always_handle() => p.handle(envelope.clone()).await,
        Some(_) => {}
        None => digest.record(&envelope),
    }
}
