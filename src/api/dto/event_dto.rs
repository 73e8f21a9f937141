//! Recent control-plane event DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::domain::{EventCategory, EventKind, PowerState, SnapshotId, VmEvent, VmId};

/// Most events a single request returns.
pub const MAX_RECENT_EVENTS: usize = 256;

/// Query parameters of `GET /events`.
#[derive(Debug, Clone, Copy, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RecentEventsParams {
    /// Number of events to return (default 20, at most 256).
    pub limit: Option<usize>,
    /// Restrict to one category: `power`, `lifecycle`, or `snapshot`.
    #[param(value_type = Option<String>)]
    pub kind: Option<EventCategory>,
}

impl RecentEventsParams {
    /// Effective limit after defaulting and capping.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(20).min(MAX_RECENT_EVENTS)
    }
}

/// One entry of the recent-event log.
#[derive(Debug, Serialize, ToSchema)]
pub struct RecentEvent {
    /// Feed sequence number.
    pub sequence: u64,
    /// Affected VM.
    #[schema(value_type = String)]
    pub vm_id: VmId,
    /// VM revision after the change.
    pub revision: u64,
    /// When the control plane recorded the change.
    pub timestamp: DateTime<Utc>,
    /// Event kind, e.g. `power_changed`.
    pub kind: String,
    /// Category of `kind`.
    pub category: EventCategory,
    /// New power state of a power event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,
    /// Snapshot of a snapshot event.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub snapshot_id: Option<SnapshotId>,
}

impl From<VmEvent> for RecentEvent {
    fn from(event: VmEvent) -> Self {
        let kind = event.kind_str().to_string();
        let category = event.kind.category();
        let (power_state, snapshot_id) = match event.kind {
            EventKind::PowerChanged { power_state } => (Some(power_state), None),
            EventKind::Created { record } => (Some(record.power_state), None),
            EventKind::Deleted => (Some(PowerState::Deleted), None),
            EventKind::SnapshotCreated { node } => (None, Some(node.id)),
            EventKind::SnapshotRemoved { snapshot_id }
            | EventKind::SnapshotReverted { snapshot_id } => (None, Some(snapshot_id)),
        };
        Self {
            sequence: event.sequence,
            vm_id: event.vm_id,
            revision: event.revision,
            timestamp: event.timestamp,
            kind,
            category,
            power_state,
            snapshot_id,
        }
    }
}
