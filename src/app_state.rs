//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::domain::{EventBus, VmStateStore};
use crate::service::{EventMonitor, LifecycleOrchestrator};

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Operation entry point and read-through queries.
    pub orchestrator: Arc<LifecycleOrchestrator>,
    /// Event-feed consumer (cursor and buffer depth for health reports).
    pub monitor: Arc<EventMonitor>,
    /// Event bus for WebSocket subscriptions.
    pub event_bus: EventBus,
}

impl AppState {
    /// VM record cache shared with the orchestrator.
    #[must_use]
    pub fn store(&self) -> &Arc<VmStateStore> {
        self.orchestrator.store()
    }
}
