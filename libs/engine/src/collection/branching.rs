//! Branching service collection
//!
//! Traversal is a jump table: execution starts at `first_service_id` and,
//! after each service, continues at whatever id the service left in the
//! message's `next_service_id`, anywhere in the collection, backward
//! jumps included. A blank id or the [`END_OF_CHAIN`](super::END_OF_CHAIN)
//! sentinel terminates the chain. Unlike the sequential list, this
//! collection cannot function without unique ids, so duplicates or blanks
//! are a configuration error at init.

use super::{apply_member, build_index, close_members, init_members, start_members, stop_members,
            END_OF_CHAIN};
use crate::context::Envelope;
use crate::error::EngineError;
use crate::lifecycle::{Component, ComponentState};
use crate::service::Service;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug)]
pub struct BranchingServiceCollection {
    name: String,
    first_service_id: String,
    services: Vec<Box<dyn Service>>,
    restart_on_failure: bool,
    index: HashMap<String, usize>,
    state: ComponentState,
}

impl BranchingServiceCollection {
    pub fn new(name: impl Into<String>, first_service_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            first_service_id: first_service_id.into(),
            services: Vec::new(),
            restart_on_failure: false,
            index: HashMap::new(),
            state: ComponentState::Closed,
        }
    }

    pub fn add_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_restart_on_failure(mut self, restart: bool) -> Self {
        self.restart_on_failure = restart;
        self
    }
}

#[async_trait]
impl Component for BranchingServiceCollection {
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
        if self.first_service_id.is_empty() {
            return Err(EngineError::invalid_config(format!(
                "branching collection '{}' has no first service id",
                self.name
            )));
        }
        self.index = build_index(&self.services).ok_or_else(|| {
            EngineError::invalid_config(format!(
                "branching collection '{}' requires unique, non-empty service ids",
                self.name
            ))
        })?;
        if !self.index.contains_key(&self.first_service_id) {
            return Err(EngineError::invalid_config(format!(
                "branching collection '{}' first service '{}' not found",
                self.name, self.first_service_id
            )));
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
impl Service for BranchingServiceCollection {
    fn id(&self) -> &str {
        &self.name
    }

    async fn apply(&mut self, envelope: &mut Envelope) -> Result<(), EngineError> {
        let mut current = self.first_service_id.clone();
        loop {
            if current.is_empty() || current == END_OF_CHAIN {
                break;
            }
            let position = *self.index.get(&current).ok_or_else(|| {
                EngineError::service_failed(
                    &self.name,
                    format!("branch target '{}' does not exist", current),
                )
            })?;

            envelope.message.clear_next_service_id();
            apply_member(
                &self.name,
                &mut self.services[position],
                envelope,
                self.restart_on_failure,
            )
            .await?;

            current = envelope.message.next_service_id().to_string();
        }
        Ok(())
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            name: self.name.clone(),
            first_service_id: self.first_service_id.clone(),
            services: self.services.iter().map(|s| s.clone_service()).collect(),
            restart_on_failure: self.restart_on_failure,
            index: HashMap::new(),
            state: ComponentState::Closed,
        })
    }
}
