//! Error taxonomy for the engine
//!
//! Errors split into four families (configuration, transient processing,
//! resource exhaustion, shutdown) so callers can decide between failing
//! fast, routing to an error handler, or retrying.

use std::time::Duration;

/// Context attached to produce/processing failures to aid in debugging
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    /// Id of the message being processed, if known
    pub message_id: Option<String>,
    /// Component (service, producer, workflow) that reported the failure
    pub component: Option<String>,
    /// Size of the message payload in bytes
    pub payload_size: usize,
}

impl FailureContext {
    pub fn new(payload_size: usize) -> Self {
        Self {
            message_id: None,
            component: None,
            payload_size,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lifecycle transition failed for '{component}': {reason}")]
    Lifecycle { component: String, reason: String },

    #[error("Service '{service}' failed: {reason}")]
    ServiceFailed { service: String, reason: String },

    #[error("Produce failed: {reason} (message: {id:?}, component: {component:?}, size: {size}B)",
            id = context.message_id,
            component = context.component,
            size = context.payload_size)]
    ProduceFailed {
        reason: String,
        context: FailureContext,
    },

    #[error("Workflow '{0}' is unavailable")]
    WorkflowUnavailable(String),

    #[error("Worker pool exhausted after {0:?}")]
    PoolExhausted(Duration),

    #[error("Retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Other error: {0}")]
    Other(String),
}

impl EngineError {
    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        EngineError::InvalidConfig(msg.into())
    }

    /// Create a lifecycle transition error
    pub fn lifecycle(component: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Lifecycle {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Create a service failure error
    pub fn service_failed(service: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ServiceFailed {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create a produce failure with minimal context
    pub fn produce_failed(reason: impl Into<String>) -> Self {
        EngineError::ProduceFailed {
            reason: reason.into(),
            context: FailureContext::default(),
        }
    }

    /// Create a produce failure with full context
    pub fn produce_failed_with_context(reason: impl Into<String>, context: FailureContext) -> Self {
        EngineError::ProduceFailed {
            reason: reason.into(),
            context,
        }
    }

    /// Check if this error is worth retrying through the error handler
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ServiceFailed { .. }
                | EngineError::ProduceFailed { .. }
                | EngineError::PoolExhausted(_)
                | EngineError::WorkflowUnavailable(_)
        )
    }

    /// Check if this is a configuration error (fails fast, never retried)
    pub fn is_config_error(&self) -> bool {
        matches!(self, EngineError::InvalidConfig(_))
    }

    /// Check if this error was caused by shutdown
    pub fn is_shutdown(&self) -> bool {
        matches!(self, EngineError::ShuttingDown)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Other(err.to_string())
    }
}
