//! The unit of processing applied to a message
//!
//! Services are lifecycle-managed components with a unique id, an async
//! `apply` hook, and an explicit deep-clone capability
//! ([`Service::clone_service`]) so a worker pool can run private copies
//! concurrently. A clone always comes back in the `Closed` state and goes
//! through its own lifecycle.

use crate::context::Envelope;
use crate::error::EngineError;
use crate::lifecycle::{Component, ComponentState};
use async_trait::async_trait;

/// A single processing step in a workflow
#[async_trait]
pub trait Service: Component {
    /// Unique id within the owning collection; used for branching
    fn id(&self) -> &str;

    /// Whether the owning collection should absorb a failure from this
    /// service and continue with the next one
    fn continue_on_failure(&self) -> bool {
        false
    }

    /// Apply this service to the message in place
    async fn apply(&mut self, envelope: &mut Envelope) -> Result<(), EngineError>;

    /// Deep-clone this service into a fresh, `Closed` instance
    ///
    /// The clone shares no mutable state with the original; it is the
    /// isolation mechanism behind pooled workers.
    fn clone_service(&self) -> Box<dyn Service>;
}

/// Adds a fixed set of metadata entries to every message
#[derive(Debug, Clone)]
pub struct AddMetadataService {
    id: String,
    entries: Vec<(String, String)>,
    next_service: Option<String>,
    continue_on_failure: bool,
    state: ComponentState,
}

impl AddMetadataService {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Vec::new(),
            next_service: None,
            continue_on_failure: false,
            state: ComponentState::Closed,
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    /// In a branching collection, route to this service id next
    pub fn with_next_service(mut self, next: impl Into<String>) -> Self {
        self.next_service = Some(next.into());
        self
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }
}

#[async_trait]
impl Component for AddMetadataService {
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
impl Service for AddMetadataService {
    fn id(&self) -> &str {
        &self.id
    }

    fn continue_on_failure(&self) -> bool {
        self.continue_on_failure
    }

    async fn apply(&mut self, envelope: &mut Envelope) -> Result<(), EngineError> {
        for (key, value) in &self.entries {
            envelope.message.add_metadata(key, value.clone());
        }
        if let Some(next) = &self.next_service {
            envelope.message.set_next_service_id(next);
        }
        Ok(())
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            state: ComponentState::Closed,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle;
    use crate::message::MessageFactory;

    #[tokio::test]
    async fn test_add_metadata_service() {
        let mut service = AddMetadataService::new("stamp")
            .with_entry("processed", "true")
            .with_entry("origin", "unit-test");
        lifecycle::request_start(&mut service).await.unwrap();

        let factory = MessageFactory::new();
        let mut envelope = Envelope::new(factory.new_message(b"hello".to_vec()));
        service.apply(&mut envelope).await.unwrap();

        assert_eq!(envelope.message.metadata_value("processed"), Some("true"));
        assert_eq!(envelope.message.metadata_value("origin"), Some("unit-test"));
        assert_eq!(envelope.message.payload(), b"hello");
    }

    #[tokio::test]
    async fn test_clone_service_resets_state() {
        let mut service = AddMetadataService::new("stamp").with_entry("k", "v");
        lifecycle::request_start(&mut service).await.unwrap();
        assert!(service.state().is_started());

        let clone = service.clone_service();
        assert!(clone.state().is_closed());
        assert_eq!(clone.id(), "stamp");
    }
}
