//! In-process side-channel travelling with a message
//!
//! The [`ProcessContext`] carries everything a pipeline stage needs to
//! communicate with later stages but which must never cross a produce or
//! encode boundary: completion callbacks, the last failure, the retry
//! counter, and the terminal-failure verdict. An [`Envelope`] bundles a
//! [`Message`] with its context; cloning an envelope deep-copies the
//! message and value-copies the context, except for the callbacks and
//! the verdict, which all clones share. A shared verdict is what keeps
//! the failure callback to a single invocation even when several copies
//! of the same message reach a handler (forced cancellation can race a
//! handler that is already running).

use crate::error::EngineError;
use crate::message::Message;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Completion callback invoked with the processed message
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Success/failure callbacks stashed by the workflow entry point so that
/// deeply nested error handlers can still signal the original caller
#[derive(Clone)]
pub struct Callbacks {
    pub on_success: MessageCallback,
    pub on_failure: MessageCallback,
}

impl Callbacks {
    pub fn new(on_success: MessageCallback, on_failure: MessageCallback) -> Self {
        Self {
            on_success,
            on_failure,
        }
    }

    /// Callbacks that do nothing; used by fire-and-forget delivery
    pub fn noop() -> Self {
        Self {
            on_success: Arc::new(|_| {}),
            on_failure: Arc::new(|_| {}),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

/// Ephemeral in-process state; never serialized, never produced
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    callbacks: Option<Callbacks>,
    failure: Option<EngineError>,
    failed_component: Option<String>,
    workflow_id: Option<String>,
    retry_count: u32,
    failed: Arc<AtomicBool>,
}

impl ProcessContext {
    pub fn set_callbacks(&mut self, callbacks: Callbacks) {
        self.callbacks = Some(callbacks);
    }

    pub fn callbacks(&self) -> Option<&Callbacks> {
        self.callbacks.as_ref()
    }

    /// Record a failure; the first failing component wins, the latest
    /// error wins
    pub fn record_failure(&mut self, error: EngineError, component: &str) {
        if self.failed_component.is_none() {
            self.failed_component = Some(component.to_string());
        }
        self.failure = Some(error);
    }

    pub fn failure(&self) -> Option<&EngineError> {
        self.failure.as_ref()
    }

    pub fn failed_component(&self) -> Option<&str> {
        self.failed_component.as_deref()
    }

    /// Workflow the message was first consumed by, used for retry routing
    pub fn set_workflow_id(&mut self, id: impl Into<String>) {
        if self.workflow_id.is_none() {
            self.workflow_id = Some(id.into());
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.workflow_id.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Whether a handler has terminally failed this message. The verdict
    /// is shared by every clone of the envelope.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Sets the verdict, returning whether it was already set
    pub(crate) fn set_failed(&self) -> bool {
        self.failed.swap(true, Ordering::SeqCst)
    }
}

/// A message plus its in-process side-channel
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    pub context: ProcessContext,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            context: ProcessContext::default(),
        }
    }

    pub fn with_callbacks(message: Message, callbacks: Callbacks) -> Self {
        let mut envelope = Self::new(message);
        envelope.context.set_callbacks(callbacks);
        envelope
    }

    /// Invoke the success callback, if any
    pub fn signal_success(&self) {
        if let Some(callbacks) = self.context.callbacks() {
            (callbacks.on_success)(&self.message);
        }
    }

    /// Terminally fail this message: set the verdict and invoke the
    /// failure callback exactly once across every clone
    pub fn mark_failed(&mut self) {
        if self.context.set_failed() {
            return;
        }
        if let Some(callbacks) = self.context.callbacks() {
            (callbacks.on_failure)(&self.message);
        }
    }
}
