//! Component lifecycle state machine
//!
//! Every managed component (workflow, service collection, connection)
//! moves through four states:
//!
//! ```text
//! CLOSED ──init──> INITIALISED ──start──> STARTED
//!   ▲                  ▲                    │
//!   └──── close ───────┴──────── stop ──────┘ (STOPPED ≙ re-startable)
//! ```
//!
//! External callers only use the `request_*` entry points; the component's
//! own `init/start/stop/close` hooks are invoked by the state machine,
//! never directly. A request is a no-op when the component is already in
//! (or ahead of) the target state, cascades through intermediate states
//! when needed (`request_start` from `Closed` performs init first), and on
//! failure reverts the component to `Closed` before propagating.
//!
//! Transitions take `&mut`, so serialization per component is enforced by
//! exclusive access; shared components live behind a `tokio::sync::Mutex`.
//! Parents are never locked together with their children: a composite
//! holds its own borrow while sequentially driving child `request_*`
//! calls.

use crate::error::EngineError;
use async_trait::async_trait;

/// The four lifecycle states shared by every managed component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentState {
    /// Not yet initialised, or fully shut down
    #[default]
    Closed,
    /// Resources acquired, not yet processing
    Initialised,
    /// Actively processing
    Started,
    /// Stopped after a start; may be started again
    Stopped,
}

impl ComponentState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ComponentState::Closed)
    }

    pub fn is_initialised(&self) -> bool {
        matches!(self, ComponentState::Initialised)
    }

    pub fn is_started(&self) -> bool {
        matches!(self, ComponentState::Started)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ComponentState::Stopped)
    }
}

/// A lifecycle-managed component
///
/// Implementors store their current state and provide the four hook
/// methods; the `request_*` free functions drive the transitions. `stop`
/// and `close` are best-effort and must not fail.
#[async_trait]
pub trait Component: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn state(&self) -> ComponentState;

    fn set_state(&mut self, state: ComponentState);

    async fn init(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stop(&mut self) {}

    async fn close(&mut self) {}
}

/// Initialise a component if it is currently closed
pub async fn request_init<C: Component + ?Sized>(component: &mut C) -> Result<(), EngineError> {
    match component.state() {
        ComponentState::Closed => {
            if let Err(e) = component.init().await {
                component.set_state(ComponentState::Closed);
                return Err(e);
            }
            component.set_state(ComponentState::Initialised);
            tracing::debug!(component = component.name(), "initialised");
            Ok(())
        }
        // Already initialised or further along
        _ => Ok(()),
    }
}

/// Start a component, initialising it first when necessary
pub async fn request_start<C: Component + ?Sized>(component: &mut C) -> Result<(), EngineError> {
    match component.state() {
        ComponentState::Closed => {
            request_init(component).await?;
            do_start(component).await
        }
        ComponentState::Initialised | ComponentState::Stopped => do_start(component).await,
        ComponentState::Started => Ok(()),
    }
}

async fn do_start<C: Component + ?Sized>(component: &mut C) -> Result<(), EngineError> {
    if let Err(e) = component.start().await {
        // A failed transition reverts to Closed; stop/close are
        // best-effort so partially acquired resources are released.
        component.stop().await;
        component.close().await;
        component.set_state(ComponentState::Closed);
        return Err(e);
    }
    component.set_state(ComponentState::Started);
    tracing::debug!(component = component.name(), "started");
    Ok(())
}

/// Stop a started component; no-op otherwise
pub async fn request_stop<C: Component + ?Sized>(component: &mut C) {
    if component.state().is_started() {
        component.stop().await;
        component.set_state(ComponentState::Stopped);
        tracing::debug!(component = component.name(), "stopped");
    }
}

/// Close a component from any state, stopping it first when started
pub async fn request_close<C: Component + ?Sized>(component: &mut C) {
    match component.state() {
        ComponentState::Closed => {}
        ComponentState::Started => {
            component.stop().await;
            component.close().await;
            component.set_state(ComponentState::Closed);
            tracing::debug!(component = component.name(), "closed");
        }
        ComponentState::Initialised | ComponentState::Stopped => {
            component.close().await;
            component.set_state(ComponentState::Closed);
            tracing::debug!(component = component.name(), "closed");
        }
    }
}
