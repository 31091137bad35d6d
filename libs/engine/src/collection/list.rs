//! Sequential service list with an optional forward-only skip
//!
//! Members run in order. When forward search is enabled and a service sets
//! the message's `next_service_id` to a *later* member's id, execution
//! jumps to that member, skipping the ones in between. Backward or unknown
//! targets are ignored. The id index is built once at init; blank or
//! duplicated ids silently disable the skip rather than failing
//! configuration, since the list runs fine without it.

use super::{apply_member, build_index, close_members, init_members, start_members, stop_members};
use crate::context::Envelope;
use crate::error::EngineError;
use crate::lifecycle::{Component, ComponentState};
use crate::service::Service;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug)]
pub struct ServiceList {
    name: String,
    services: Vec<Box<dyn Service>>,
    restart_on_failure: bool,
    forward_search: bool,
    index: Option<HashMap<String, usize>>,
    state: ComponentState,
}

impl ServiceList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: Vec::new(),
            restart_on_failure: false,
            forward_search: false,
            index: None,
            state: ComponentState::Closed,
        }
    }

    pub fn add_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Restart a failed member (stop, close, init, start) before the
    /// failure verdict is applied
    pub fn with_restart_on_failure(mut self, restart: bool) -> Self {
        self.restart_on_failure = restart;
        self
    }

    /// Enable the forward-only skip driven by `next_service_id`
    pub fn with_forward_search(mut self, forward_search: bool) -> Self {
        self.forward_search = forward_search;
        self
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[async_trait]
impl Component for ServiceList {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }

    async fn init(&mut self) -> Result<(), EngineError> {
        if self.forward_search {
            self.index = build_index(&self.services);
            if self.index.is_none() {
                tracing::debug!(
                    collection = %self.name,
                    "duplicate or missing service ids, forward search disabled"
                );
            }
        }
        init_members(&self.name, &mut self.services).await
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        start_members(&self.name, &mut self.services).await
    }

    async fn stop(&mut self) {
        stop_members(&mut self.services).await;
    }

    async fn close(&mut self) {
        close_members(&mut self.services).await;
    }
}

#[async_trait]
impl Service for ServiceList {
    fn id(&self) -> &str {
        &self.name
    }

    async fn apply(&mut self, envelope: &mut Envelope) -> Result<(), EngineError> {
        let mut position = 0;
        while position < self.services.len() {
            envelope.message.clear_next_service_id();
            apply_member(
                &self.name,
                &mut self.services[position],
                envelope,
                self.restart_on_failure,
            )
            .await?;

            let requested = envelope.message.next_service_id();
            if !requested.is_empty() {
                if let Some(index) = &self.index {
                    if let Some(&target) = index.get(requested) {
                        if target > position {
                            position = target;
                            continue;
                        }
                        // Backward jumps are not allowed here.
                        tracing::debug!(
                            collection = %self.name,
                            requested,
                            "ignoring non-forward skip target"
                        );
                    }
                }
            }
            position += 1;
        }
        Ok(())
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            name: self.name.clone(),
            services: self.services.iter().map(|s| s.clone_service()).collect(),
            restart_on_failure: self.restart_on_failure,
            forward_search: self.forward_search,
            index: None,
            state: ComponentState::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle;
    use crate::message::MessageFactory;
    use crate::service::AddMetadataService;
    use crate::test_utils::{FailingService, RecordingService, RouteService};
    use std::sync::Arc;

    fn envelope() -> Envelope {
        Envelope::new(MessageFactory::new().new_message(b"payload".to_vec()))
    }

    #[tokio::test]
    async fn test_runs_members_in_order() {
        let log = RecordingService::shared_log();
        let mut list = ServiceList::new("chain")
            .add_service(Box::new(RecordingService::new("a", log.clone())))
            .add_service(Box::new(RecordingService::new("b", log.clone())))
            .add_service(Box::new(RecordingService::new("c", log.clone())));
        lifecycle::request_start(&mut list).await.unwrap();

        let mut env = envelope();
        list.apply(&mut env).await.unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(env.message.trail().len(), 3);
        assert!(env.message.trail().iter().all(|m| m.success));
    }

    #[tokio::test]
    async fn test_forward_skip_jumps_over_intermediates() {
        let log = RecordingService::shared_log();
        let mut list = ServiceList::new("chain")
            .with_forward_search(true)
            .add_service(Box::new(RouteService::new("router", "c")))
            .add_service(Box::new(RecordingService::new("b", log.clone())))
            .add_service(Box::new(RecordingService::new("c", log.clone())));
        lifecycle::request_start(&mut list).await.unwrap();

        let mut env = envelope();
        list.apply(&mut env).await.unwrap();

        assert_eq!(*log.lock(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_backward_target_is_ignored() {
        let log = RecordingService::shared_log();
        let mut list = ServiceList::new("chain")
            .with_forward_search(true)
            .add_service(Box::new(RecordingService::new("a", log.clone())))
            .add_service(Box::new(RouteService::new("router", "a")))
            .add_service(Box::new(RecordingService::new("z", log.clone())));
        lifecycle::request_start(&mut list).await.unwrap();

        let mut env = envelope();
        list.apply(&mut env).await.unwrap();

        // No backward jump: "a" ran once and the list continued to "z".
        assert_eq!(*log.lock(), vec!["a", "z"]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_disable_forward_search() {
        let log = RecordingService::shared_log();
        let mut list = ServiceList::new("chain")
            .with_forward_search(true)
            .add_service(Box::new(RouteService::new("dup", "c")))
            .add_service(Box::new(RecordingService::new("dup", log.clone())))
            .add_service(Box::new(RecordingService::new("c", log.clone())));
        lifecycle::request_start(&mut list).await.unwrap();

        let mut env = envelope();
        list.apply(&mut env).await.unwrap();

        // Skip silently disabled, all members ran.
        assert_eq!(*log.lock(), vec!["dup", "c"]);
    }

    #[tokio::test]
    async fn test_continue_on_failure_absorbs_error() {
        let log = RecordingService::shared_log();
        let mut list = ServiceList::new("chain")
            .add_service(Box::new(FailingService::new("boom").with_continue_on_failure(true)))
            .add_service(Box::new(RecordingService::new("after", log.clone())));
        lifecycle::request_start(&mut list).await.unwrap();

        let mut env = envelope();
        list.apply(&mut env).await.unwrap();

        assert_eq!(*log.lock(), vec!["after"]);
        // The failure was still recorded on the side-channel and trail.
        assert_eq!(env.context.failed_component(), Some("boom"));
        assert!(!env.message.trail()[0].success);
    }

    #[tokio::test]
    async fn test_hard_failure_propagates() {
        let log = RecordingService::shared_log();
        let mut list = ServiceList::new("chain")
            .add_service(Box::new(FailingService::new("boom")))
            .add_service(Box::new(RecordingService::new("after", log.clone())));
        lifecycle::request_start(&mut list).await.unwrap();

        let mut env = envelope();
        let result = list.apply(&mut env).await;

        assert!(matches!(
            result,
            Err(EngineError::ServiceFailed { ref service, .. }) if service == "boom"
        ));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_nested_collection_runs_as_single_member() {
        let inner = ServiceList::new("inner")
            .add_service(Box::new(AddMetadataService::new("stamp").with_entry("k", "v")));
        let mut outer = ServiceList::new("outer").add_service(Box::new(inner));
        lifecycle::request_start(&mut outer).await.unwrap();

        let mut env = envelope();
        outer.apply(&mut env).await.unwrap();

        assert_eq!(env.message.metadata_value("k"), Some("v"));
        // Markers: one from the inner member, one for the nested
        // collection itself.
        let names: Vec<&str> = env
            .message
            .trail()
            .iter()
            .map(|m| m.component_name.as_str())
            .collect();
        assert_eq!(names, vec!["stamp", "inner"]);
    }

    #[tokio::test]
    async fn test_clone_service_is_deep_and_closed() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut list = ServiceList::new("chain")
            .with_forward_search(true)
            .add_service(Box::new(RecordingService::new("a", log.clone())));
        lifecycle::request_start(&mut list).await.unwrap();

        let clone = list.clone_service();
        assert!(clone.state().is_closed());
        assert_eq!(clone.id(), "chain");
        assert!(list.state().is_started());
    }
}
