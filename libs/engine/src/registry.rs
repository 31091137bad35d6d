//! Explicit workflow lookup
//!
//! Components that need to find a workflow by name (the retry scheduler
//! above all) get a [`WorkflowRegistry`] handed to them at construction
//! time, resolved when the engine is wired up rather than through any
//! runtime naming service.

use crate::workflow::Workflow;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A workflow shared between its channel, inbound endpoints, and the
/// retry scheduler; the mutex serializes lifecycle transitions and
/// message submission
pub type SharedWorkflow = Arc<Mutex<Box<dyn Workflow>>>;

/// Name -> workflow map
#[derive(Debug, Default, Clone)]
pub struct WorkflowRegistry {
    workflows: Arc<DashMap<String, SharedWorkflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its own id, returning the shared handle
    pub fn register(&self, workflow: Box<dyn Workflow>) -> SharedWorkflow {
        let id = workflow.id().to_string();
        let shared: SharedWorkflow = Arc::new(Mutex::new(workflow));
        if self
            .workflows
            .insert(id.clone(), shared.clone())
            .is_some()
        {
            tracing::warn!(workflow = %id, "replacing previously registered workflow");
        }
        shared
    }

    pub fn lookup(&self, id: &str) -> Option<SharedWorkflow> {
        self.workflows.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workflows.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<SharedWorkflow> {
        self.workflows.remove(id).map(|(_, workflow)| workflow)
    }

    pub fn ids(&self) -> Vec<String> {
        self.workflows.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::ServiceList;
    use crate::test_utils::CollectorProducer;
    use crate::workflow::{StandardWorkflow, WorkflowConfig};

    fn workflow(id: &str) -> Box<dyn Workflow> {
        Box::new(StandardWorkflow::new(
            WorkflowConfig::new(id, "channel-1"),
            ServiceList::new("services"),
            Arc::new(CollectorProducer::new()),
        ))
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = WorkflowRegistry::new();
        registry.register(workflow("wf-1"));

        assert!(registry.contains("wf-1"));
        assert!(!registry.contains("wf-2"));
        assert_eq!(registry.len(), 1);

        let shared = registry.lookup("wf-1").unwrap();
        assert_eq!(shared.lock().await.id(), "wf-1");
    }

    #[tokio::test]
    async fn test_reregistration_replaces() {
        let registry = WorkflowRegistry::new();
        registry.register(workflow("wf-1"));
        registry.register(workflow("wf-1"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = WorkflowRegistry::new();
        registry.register(workflow("wf-1"));
        assert!(registry.remove("wf-1").is_some());
        assert!(registry.is_empty());
    }
}
