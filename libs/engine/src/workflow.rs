//! The consume -> service-chain -> produce pipeline
//!
//! A [`StandardWorkflow`] processes one message at a time: the inbound
//! message is cloned, the clone is stamped and run through the service
//! collection, then produced; failures are attached to the clone and
//! routed to the configured error handler, which decides whether the
//! message is terminally failed or deferred (retry). The original message
//! is retained untouched for error reporting. An error never escapes
//! `on_message`; it is always converted into a routed failure.
//!
//! The per-message pipeline is shared with
//! [`PoolingWorkflow`](crate::pool::PoolingWorkflow) through
//! [`PipelineContext`]/[`run_pipeline`].

use crate::collection::ServiceList;
use crate::context::{Callbacks, Envelope};
use crate::error::EngineError;
use crate::events::{EventAggregator, NoOpAggregator};
use crate::handler::{ErrorHandler, FailureDigest, StandardErrorHandler};
use crate::lifecycle::{Component, ComponentState};
use crate::message::{Message, CHANNEL_ID_KEY, WORKFLOW_ID_KEY};
use crate::service::Service;
use crate::MessageProducer;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pre/post-processing hook notified around every workflow invocation
pub trait WorkflowObserver: Send + Sync + std::fmt::Debug {
    fn workflow_started(&self, envelope: &Envelope);

    /// Notified with both the untouched original and the processed
    /// work-in-progress envelope
    fn workflow_ended(&self, original: &Envelope, processed: &Envelope);
}

/// Identity of a workflow within its owning channel
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub id: String,
    pub channel_id: String,
}

impl WorkflowConfig {
    pub fn new(id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::invalid_config("workflow id must not be empty"));
        }
        if self.channel_id.is_empty() {
            return Err(EngineError::invalid_config("channel id must not be empty"));
        }
        Ok(())
    }
}

/// A message pipeline bound to one inbound endpoint
#[async_trait]
pub trait Workflow: Component {
    fn id(&self) -> &str;

    /// Accept one message for processing; never returns an error, every
    /// failure is routed through the configured error handler
    async fn on_message(&mut self, envelope: Envelope);

    /// Inbound-endpoint entry point: accept a message with explicit
    /// completion callbacks
    async fn process_message(&mut self, message: Message, callbacks: Callbacks) {
        self.on_message(Envelope::with_callbacks(message, callbacks))
            .await;
    }

    /// Fire-and-forget delivery, also used by retry resubmission when the
    /// original callbacks travel inside the envelope
    async fn deliver(&mut self, message: Message) {
        self.on_message(Envelope::new(message)).await;
    }
}

/// Everything the per-message pipeline needs, cheaply cloneable so the
/// pooling workflow can hand it to spawned tasks
#[derive(Debug, Clone)]
pub(crate) struct PipelineContext {
    pub workflow_id: String,
    pub channel_id: String,
    pub producer: Arc<dyn MessageProducer>,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub aggregator: Arc<dyn EventAggregator>,
    pub observers: Vec<Arc<dyn WorkflowObserver>>,
    pub channel_available: Arc<AtomicBool>,
}

/// Outcome of one pipeline run
pub(crate) struct PipelineRun {
    /// Whether the service chain itself failed (as opposed to the
    /// producer); pooled workers are invalidated on this
    pub service_failed: bool,
}

/// Run one message through the shared pipeline: availability check,
/// clone, stamp, service chain, produce, failure routing, audit
pub(crate) async fn run_pipeline(
    ctx: &PipelineContext,
    services: &mut dyn Service,
    mut envelope: Envelope,
) -> PipelineRun {
    envelope.context.set_workflow_id(&ctx.workflow_id);

    // An unavailable channel short-circuits straight to failure routing.
    if !ctx.channel_available.load(Ordering::Acquire) {
        envelope.context.record_failure(
            EngineError::WorkflowUnavailable(ctx.workflow_id.clone()),
            &ctx.workflow_id,
        );
        ctx.error_handler.handle(envelope).await;
        return PipelineRun {
            service_failed: false,
        };
    }

    for observer in &ctx.observers {
        observer.workflow_started(&envelope);
    }

    // The original is retained untouched for error reporting; the clone
    // is the work-in-progress.
    let original = envelope;
    let mut wip = original.clone();
    wip.message.add_metadata(WORKFLOW_ID_KEY, &ctx.workflow_id);
    wip.message.add_metadata(CHANNEL_ID_KEY, &ctx.channel_id);
    // Receipt already happened, so this marker is always successful.
    wip.message.add_marker(&ctx.workflow_id, "received", true);

    let mut failure: Option<EngineError> = None;
    let mut service_failed = false;

    match services.apply(&mut wip).await {
        Ok(()) => {
            if wip.message.skip_producer() {
                tracing::debug!(
                    workflow = %ctx.workflow_id,
                    message_id = wip.message.id(),
                    "skip-producer flag set, not producing"
                );
            } else {
                match ctx.producer.produce(&wip.message).await {
                    Ok(()) => {
                        wip.message.add_marker(ctx.producer.name(), "produce", true);
                    }
                    Err(e) => {
                        // A produce marker distinct from service markers
                        // lets digesters tell delivery errors from
                        // transformation errors.
                        wip.message.add_marker(ctx.producer.name(), "produce", false);
                        failure = Some(e);
                    }
                }
            }
        }
        Err(e) => {
            failure = Some(e);
            service_failed = true;
        }
    }

    match failure {
        None => {
            wip.signal_success();
        }
        Some(error) => {
            tracing::warn!(
                workflow = %ctx.workflow_id,
                message_id = wip.message.id(),
                error = %error,
                "message processing failed, routing to error handler"
            );
            wip.context.record_failure(error, &ctx.workflow_id);
            // The handler decides whether this is terminal or deferred;
            // the failure callback fires only on a terminal verdict.
            ctx.error_handler.handle(wip.clone()).await;
        }
    }

    // Best-effort audit emission.
    ctx.aggregator.record_trail(wip.message.id(), wip.message.trail());
    for observer in &ctx.observers {
        observer.workflow_ended(&original, &wip);
    }

    PipelineRun { service_failed }
}

/// Single-message-at-a-time workflow
///
/// Safe to share behind a `tokio::sync::Mutex`; the exclusive borrow on
/// `on_message` is what serializes processing.
#[derive(Debug)]
pub struct StandardWorkflow {
    config: WorkflowConfig,
    services: ServiceList,
    producer: Arc<dyn MessageProducer>,
    error_handler: Arc<dyn ErrorHandler>,
    aggregator: Arc<dyn EventAggregator>,
    observers: Vec<Arc<dyn WorkflowObserver>>,
    channel_available: Arc<AtomicBool>,
    state: ComponentState,
}

impl StandardWorkflow {
    pub fn new(
        config: WorkflowConfig,
        services: ServiceList,
        producer: Arc<dyn MessageProducer>,
    ) -> Self {
        let handler = StandardErrorHandler::new(
            format!("{}-error-handler", config.id),
            Arc::new(FailureDigest::default()),
        );
        Self {
            config,
            services,
            producer,
            error_handler: Arc::new(handler),
            aggregator: Arc::new(NoOpAggregator),
            observers: Vec::new(),
            channel_available: Arc::new(AtomicBool::new(true)),
            state: ComponentState::Closed,
        }
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn EventAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn add_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Shared flag the owning channel flips to mark this workflow
    /// (un)available
    pub fn availability_flag(&self) -> Arc<AtomicBool> {
        self.channel_available.clone()
    }

    fn pipeline_context(&self) -> PipelineContext {
        PipelineContext {
            workflow_id: self.config.id.clone(),
            channel_id: self.config.channel_id.clone(),
            producer: self.producer.clone(),
            error_handler: self.error_handler.clone(),
            aggregator: self.aggregator.clone(),
            observers: self.observers.clone(),
            channel_available: self.channel_available.clone(),
        }
    }
}

#[async_trait]
impl Component for StandardWorkflow {
    fn name(&self) -> &str {
        &self.config.id
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }

    async fn init(&mut self) -> Result<(), EngineError> {
        self.config.validate()?;
        crate::lifecycle::request_init(&mut self.services).await
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        self.error_handler.activate().await;
        crate::lifecycle::request_start(&mut self.services).await
    }

    async fn stop(&mut self) {
        self.error_handler.shutdown().await;
        crate::lifecycle::request_stop(&mut self.services).await;
    }

    async fn close(&mut self) {
        crate::lifecycle::request_close(&mut self.services).await;
    }
}

#[async_trait]
impl Workflow for StandardWorkflow {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn on_message(&mut self, envelope: Envelope) {
        let ctx = self.pipeline_context();
        run_pipeline(&ctx, &mut self.services, envelope).await;
    }
}
