//! Fan-out service list
//!
//! Each member receives an independent clone of the current envelope, so
//! members never observe each other's mutations. Selected metadata keys
//! can be copied back into the original after each clone completes, which
//! is how a fan-out branch reports a result to the main flow.

use super::{apply_member, close_members, init_members, start_members, stop_members};
use crate::context::Envelope;
use crate::error::EngineError;
use crate::lifecycle::{Component, ComponentState};
use crate::service::Service;
use async_trait::async_trait;

#[derive(Debug)]
pub struct CloneMessageServiceList {
    name: String,
    services: Vec<Box<dyn Service>>,
    copy_metadata_keys: Vec<String>,
    restart_on_failure: bool,
    state: ComponentState,
}

impl CloneMessageServiceList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: Vec::new(),
            copy_metadata_keys: Vec::new(),
            restart_on_failure: false,
            state: ComponentState::Closed,
        }
    }

    pub fn add_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Copy these metadata keys from each completed clone back into the
    /// original message
    pub fn with_copy_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.copy_metadata_keys.push(key.into());
        self
    }

    pub fn with_restart_on_failure(mut self, restart: bool) -> Self {
        self.restart_on_failure = restart;
        self
    }
}

#[async_trait]
impl Component for CloneMessageServiceList {
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
impl Service for CloneMessageServiceList {
    fn id(&self) -> &str {
        &self.name
    }

    async fn apply(&mut self, envelope: &mut Envelope) -> Result<(), EngineError> {
        for position in 0..self.services.len() {
            let mut branch = envelope.clone();
            apply_member(
                &self.name,
                &mut self.services[position],
                &mut branch,
                self.restart_on_failure,
            )
            .await?;

            for key in &self.copy_metadata_keys {
                if let Some(value) = branch.message.metadata_value(key) {
                    let value = value.to_string();
                    envelope.message.add_metadata(key, value);
                }
            }
        }
        Ok(())
    }

    fn clone_service(&self) -> Box<dyn Service> {
        Box::new(Self {
            name: self.name.clone(),
            services: self.services.iter().map(|s| s.clone_service()).collect(),
            copy_metadata_keys: self.copy_metadata_keys.clone(),
            restart_on_failure: self.restart_on_failure,
            state: ComponentState::Closed,
        })
    }
}
