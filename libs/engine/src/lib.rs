//! Flowbus message-processing engine
//!
//! Routes messages from inbound endpoints through chains of services to
//! outbound producers. The moving parts:
//!
//! - **Lifecycle** ([`lifecycle`]): the four-state machine every managed
//!   component follows, driven via the `request_*` entry points.
//! - **Messages** ([`message`]): payload + metadata + a lifecycle trail
//!   of markers recording which component touched the message and how it
//!   went.
//! - **Services** ([`service`], [`collection`]): units of work composed
//!   into sequential, branching, or fan-out collections.
//! - **Workflows** ([`workflow`], [`pool`]): the consume -> service-chain
//!   -> produce pipeline, single-message or pooled for bounded
//!   concurrency.
//! - **Failure handling** ([`handler`], [`retry`]): scoped error
//!   handlers with parent escalation, a shared failure digest, and
//!   scheduled resubmission of failed messages.
//!
//! ```no_run
//! use flowbus_engine::{
//!     lifecycle, AddMetadataService, Callbacks, MessageFactory, NullProducer, ServiceList,
//!     StandardWorkflow, Workflow, WorkflowConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), flowbus_engine::EngineError> {
//! let services = ServiceList::new("services")
//!     .add_service(Box::new(AddMetadataService::new("stamp").with_entry("processed", "true")));
//! let mut workflow = StandardWorkflow::new(
//!     WorkflowConfig::new("wf-1", "channel-1"),
//!     services,
//!     Arc::new(NullProducer),
//! );
//! lifecycle::request_start(&mut workflow).await?;
//!
//! let factory = MessageFactory::new();
//! workflow
//!     .process_message(factory.new_message(b"hello".to_vec()), Callbacks::noop())
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handler;
pub mod lifecycle;
pub mod message;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod service;
pub mod test_utils;
pub mod workflow;

use async_trait::async_trait;
use std::fmt::Debug;

pub use collection::{
    BranchingServiceCollection, CloneMessageServiceList, ServiceList, END_OF_CHAIN,
};
pub use config::{EngineConfig, PoolSection, RetrySection, WorkflowSection};
pub use context::{Callbacks, Envelope, MessageCallback, ProcessContext};
pub use error::{EngineError, FailureContext};
pub use events::{EventAggregator, InMemoryAggregator, NoOpAggregator};
pub use handler::{DigestEntry, ErrorHandler, FailureDigest, StandardErrorHandler};
pub use lifecycle::{Component, ComponentState};
pub use message::{
    IdGenerator, Message, MessageFactory, MessageMarker, UuidGenerator, CHANNEL_ID_KEY,
    METADATA_RESOLVE_PREFIX, SEQUENCE_NUMBER_KEY, SKIP_PRODUCER_KEY, WORKFLOW_ID_KEY,
};
pub use pool::{PoolConfig, PoolingWorkflow};
pub use registry::{SharedWorkflow, WorkflowRegistry};
pub use retry::{RetryConfig, RetryErrorHandler};
pub use service::{AddMetadataService, Service};
pub use workflow::{StandardWorkflow, Workflow, WorkflowConfig, WorkflowObserver};

/// An outbound endpoint that delivers processed messages
#[async_trait]
pub trait MessageProducer: Send + Sync + Debug {
    /// Deliver one message
    async fn produce(&self, message: &Message) -> Result<(), EngineError>;

    /// Name used in lifecycle-trail markers and logs
    fn name(&self) -> &str {
        "producer"
    }
}

/// Producer that discards every message
#[derive(Debug, Default)]
pub struct NullProducer;

#[async_trait]
impl MessageProducer for NullProducer {
    async fn produce(&self, message: &Message) -> Result<(), EngineError> {
        tracing::debug!(message_id = message.id(), "discarding message");
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}
