//! Test doubles for pipelines and producers
//!
//! Exported as a regular module so integration tests and downstream
//! crates can drive a workflow without real endpoints: a collecting
//! producer with failure injection, services that record, route, fail,
//! or stall, and recording error handlers/observers.

use crate::context::Envelope;
use crate::error::EngineError;
use crate::handler::ErrorHandler;
use crate::lifecycle::{Component, ComponentState};
use crate::message::Message;
use crate::service::Service;
use crate::workflow::WorkflowObserver;
use crate::MessageProducer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Producer that collects produced messages in memory
///
/// `fail_next` injects exactly one produce failure.
#[derive(Debug, Default)]
pub struct CollectorProducer {
    produced: Mutex<Vec<Message>>,
    fail_next: AtomicBool,
}

impl CollectorProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn produced(&self) -> Vec<Message> {
        self.produced.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.produced.lock().len()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageProducer for CollectorProducer {
    async fn produce(&self, message: &Message) -> Result<(), EngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::produce_failed("injected produce failure"));
        }
        self.produced.lock().push(message.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "collector"
    }
}

/// Service that appends its id to a shared log on every apply
#[derive(Debug)]
pub struct RecordingService {
    id: String,
    log: Arc<Mutex<Vec<String>>>,
    state: ComponentState,
}

impl RecordingService {
    pub fn new(id: impl Into<String>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            id: id.into(),
            log,
            state: ComponentState::Closed,
        }
    }

    pub fn shared_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }
}

#[async_trait]
impl Component for RecordingService {
    fn name(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }
}

#[async_trait]
impl Service for RecordingService {
    fn id(&self) -> &str {
        &self.id
    }

    async fn apply(&mut self, _envelope: &mut Envelope) -> Result<(), EngineError> {
        self.log.lock().push(self.id.clone());
        Ok(())
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            id: self.id.clone(),
            log: self.log.clone(),
            state: ComponentState::Closed,
        })
    }
}

/// Service that requests a jump to another service id
#[derive(Debug)]
pub struct RouteService {
    id: String,
    target: String,
    state: ComponentState,
}

impl RouteService {
    pub fn new(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            state: ComponentState::Closed,
        }
    }
}

#[async_trait]
impl Component for RouteService {
    fn name(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }
}

#[async_trait]
impl Service for RouteService {
    fn id(&self) -> &str {
        &self.id
    }

    async fn apply(&mut self, envelope: &mut Envelope) -> Result<(), EngineError> {
        envelope.message.set_next_service_id(&self.target);
        Ok(())
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            id: self.id.clone(),
            target: self.target.clone(),
            state: ComponentState::Closed,
        })
    }
}

/// Service that always fails
#[derive(Debug)]
pub struct FailingService {
    id: String,
    continue_on_failure: bool,
    state: ComponentState,
}

impl FailingService {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            continue_on_failure: false,
            state: ComponentState::Closed,
        }
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }
}

#[async_trait]
impl Component for FailingService {
    fn name(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }
}

#[async_trait]
impl Service for FailingService {
    fn id(&self) -> &str {
        &self.id
    }

    fn continue_on_failure(&self) -> bool {
        self.continue_on_failure
    }

    async fn apply(&mut self, _envelope: &mut Envelope) -> Result<(), EngineError> {
        Err(EngineError::service_failed(&self.id, "boom"))
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            id: self.id.clone(),
            continue_on_failure: self.continue_on_failure,
            state: ComponentState::Closed,
        })
    }
}

/// Service that fails its first `fail_times` applies, then succeeds
#[derive(Debug)]
pub struct FlakyService {
    id: String,
    failures_left: usize,
    state: ComponentState,
}

impl FlakyService {
    pub fn new(id: impl Into<String>, fail_times: usize) -> Self {
        Self {
            id: id.into(),
            failures_left: fail_times,
            state: ComponentState::Closed,
        }
    }
}

#[async_trait]
impl Component for FlakyService {
    fn name(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }
}

#[async_trait]
impl Service for FlakyService {
    fn id(&self) -> &str {
        &self.id
    }

    async fn apply(&mut self, _envelope: &mut Envelope) -> Result<(), EngineError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(EngineError::service_failed(&self.id, "transient failure"));
        }
        Ok(())
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            id: self.id.clone(),
            failures_left: self.failures_left,
            state: ComponentState::Closed,
        })
    }
}

/// Service that sleeps in apply, tracking peak concurrency across clones
#[derive(Debug)]
pub struct SlowService {
    id: String,
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    state: ComponentState,
}

impl SlowService {
    pub fn new(id: impl Into<String>, delay: Duration) -> Self {
        Self {
            id: id.into(),
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            state: ComponentState::Closed,
        }
    }

    /// Highest number of concurrent applies seen across all clones
    pub fn peak_handle(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }
}

#[async_trait]
impl Component for SlowService {
    fn name(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }
}

#[async_trait]
impl Service for SlowService {
    fn id(&self) -> &str {
        &self.id
    }

    async fn apply(&mut self, _envelope: &mut Envelope) -> Result<(), EngineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            id: self.id.clone(),
            delay: self.delay,
            active: self.active.clone(),
            peak: self.peak.clone(),
            state: ComponentState::Closed,
        })
    }
}

/// Error handler that records every envelope it is given
#[derive(Debug, Default)]
pub struct RecordingHandler {
    handled: Mutex<Vec<Envelope>>,
    always_handle: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_always_handle(mut self, always_handle: bool) -> Self {
        self.always_handle = always_handle;
        self
    }

    pub fn handled_envelopes(&self) -> Vec<Envelope> {
        self.handled.lock().clone()
    }

    pub fn handled_ids(&self) -> Vec<String> {
        self.handled
            .lock()
            .iter()
            .map(|e| e.message.id().to_string())
            .collect()
    }

    pub fn handled_errors(&self) -> Vec<String> {
        self.handled
            .lock()
            .iter()
            .filter_map(|e| e.context.failure().map(|err| err.to_string()))
            .collect()
    }
}

#[async_trait]
impl ErrorHandler for RecordingHandler {
    async fn handle(&self, envelope: Envelope) {
        self.handled.lock().push(envelope);
    }

    fn always_handle(&self) -> bool {
        self.always_handle
    }
}

/// Observer that counts start/end notifications
#[derive(Debug, Default)]
pub struct RecordingObserver {
    started: AtomicUsize,
    ended: AtomicUsize,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn ended_count(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

impl WorkflowObserver for RecordingObserver {
    fn workflow_started(&self, _envelope: &Envelope) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn workflow_ended(&self, _original: &Envelope, _processed: &Envelope) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}
