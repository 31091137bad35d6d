//! Composable chains of services
//!
//! Three traversal variants share the machinery in this module:
//!
//! - [`ServiceList`](list::ServiceList): ordered execution with an
//!   optional forward-only skip
//! - [`BranchingServiceCollection`](branching::BranchingServiceCollection):
//!   jump-table traversal driven by the message's `next_service_id`
//! - [`CloneMessageServiceList`](clone_list::CloneMessageServiceList):
//!   fan-out, each member sees an independent clone
//!
//! Collections implement [`Service`] themselves, so they nest. Lifecycle
//! cascades run forward for init/start and in reverse for stop/close; a
//! failed cascade unwinds the members already advanced, in reverse order,
//! before the error propagates.

pub mod branching;
pub mod clone_list;
pub mod list;

pub use branching::BranchingServiceCollection;
pub use clone_list::CloneMessageServiceList;
pub use list::ServiceList;

use crate::context::Envelope;
use crate::error::EngineError;
use crate::lifecycle;
use crate::service::Service;
use std::collections::HashMap;

/// Sentinel `next_service_id` terminating a branching chain
pub const END_OF_CHAIN: &str = "end";

/// Initialise members in order, unwinding already-initialised members in
/// reverse on failure
pub(crate) async fn init_members(
    collection_name: &str,
    services: &mut [Box<dyn Service>],
) -> Result<(), EngineError> {
    for i in 0..services.len() {
        if let Err(e) = lifecycle::request_init(services[i].as_mut()).await {
            tracing::warn!(
                collection = collection_name,
                service = services[i].id(),
                error = %e,
                "member init failed, unwinding"
            );
            for advanced in services[..i].iter_mut().rev() {
                lifecycle::request_close(advanced.as_mut()).await;
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Start members in order, unwinding already-started members in reverse
/// on failure
pub(crate) async fn start_members(
    collection_name: &str,
    services: &mut [Box<dyn Service>],
) -> Result<(), EngineError> {
    for i in 0..services.len() {
        if let Err(e) = lifecycle::request_start(services[i].as_mut()).await {
            tracing::warn!(
                collection = collection_name,
                service = services[i].id(),
                error = %e,
                "member start failed, unwinding"
            );
            for advanced in services[..i].iter_mut().rev() {
                lifecycle::request_stop(advanced.as_mut()).await;
                lifecycle::request_close(advanced.as_mut()).await;
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Stop members in reverse order (best-effort)
pub(crate) async fn stop_members(services: &mut [Box<dyn Service>]) {
    for service in services.iter_mut().rev() {
        lifecycle::request_stop(service.as_mut()).await;
    }
}

/// Close members in reverse order (best-effort)
pub(crate) async fn close_members(services: &mut [Box<dyn Service>]) {
    for service in services.iter_mut().rev() {
        lifecycle::request_close(service.as_mut()).await;
    }
}

/// Apply one member service with the shared failure policy
///
/// On failure this attaches the error and the offending service id to the
/// envelope's context, optionally restarts the service, and either
/// absorbs the failure (`continue_on_failure`) or re-wraps and propagates
/// it to the owning workflow.
pub(crate) async fn apply_member(
    collection_name: &str,
    service: &mut Box<dyn Service>,
    envelope: &mut Envelope,
    restart_on_failure: bool,
) -> Result<(), EngineError> {
    let service_id = service.id().to_string();
    match service.apply(envelope).await {
        Ok(()) => {
            envelope.message.add_marker(&service_id, "service", true);
            Ok(())
        }
        Err(e) => {
            envelope.message.add_marker(&service_id, "service", false);
            envelope.context.record_failure(e.clone(), &service_id);

            if restart_on_failure {
                tracing::info!(
                    collection = collection_name,
                    service = %service_id,
                    "restarting failed service"
                );
                lifecycle::request_stop(service.as_mut()).await;
                lifecycle::request_close(service.as_mut()).await;
                if let Err(restart_err) = lifecycle::request_start(service.as_mut()).await {
                    tracing::warn!(
                        collection = collection_name,
                        service = %service_id,
                        error = %restart_err,
                        "failed service could not be restarted"
                    );
                }
            }

            if service.continue_on_failure() {
                tracing::warn!(
                    collection = collection_name,
                    service = %service_id,
                    error = %e,
                    "service failed, continuing"
                );
                Ok(())
            } else {
                Err(EngineError::service_failed(&service_id, e.to_string()))
            }
        }
    }
}

/// Build an id -> position index over the members
///
/// Returns `None` when an id is blank or duplicated; the caller decides
/// whether that is a configuration error or silently disables branching.
pub(crate) fn build_index(services: &[Box<dyn Service>]) -> Option<HashMap<String, usize>> {
    let mut index = HashMap::with_capacity(services.len());
    for (position, service) in services.iter().enumerate() {
        let id = service.id();
        if id.is_empty() {
            return None;
        }
        if index.insert(id.to_string(), position).is_some() {
            return None;
        }
    }
    Some(index)
}
