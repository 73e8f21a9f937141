//! Control-plane events consumed by the event monitor.
//!
//! Events are confirmed facts, not requests. Each carries a control-plane
//! sequence number (strictly increasing across the feed) and the revision of
//! the affected VM after the change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{PowerState, Revision, SnapshotId, SnapshotNode, VmId, VmRecord};

/// Monotonic sequence number assigned by the control plane's event feed.
pub type Sequence = u64;

/// Event payload by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// VM power state changed.
    PowerChanged {
        /// New power state.
        power_state: PowerState,
    },
    /// VM came into existence.
    Created {
        /// Full record of the new VM.
        record: VmRecord,
    },
    /// VM was destroyed.
    Deleted,
    /// Snapshot captured.
    SnapshotCreated {
        /// The new node.
        node: SnapshotNode,
    },
    /// Snapshot removed (children reparented by the control plane).
    SnapshotRemoved {
        /// Removed snapshot.
        snapshot_id: SnapshotId,
    },
    /// VM reverted to a snapshot.
    SnapshotReverted {
        /// Snapshot now active.
        snapshot_id: SnapshotId,
    },
}

/// Coarse grouping of event kinds, used to filter the recent-event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Power state changes.
    Power,
    /// Creation and deletion.
    Lifecycle,
    /// Snapshot capture, removal, and revert.
    Snapshot,
}

impl EventKind {
    /// Category this kind belongs to.
    #[must_use]
    pub const fn category(&self) -> EventCategory {
        match self {
            Self::PowerChanged { .. } => EventCategory::Power,
            Self::Created { .. } | Self::Deleted => EventCategory::Lifecycle,
            Self::SnapshotCreated { .. }
            | Self::SnapshotRemoved { .. }
            | Self::SnapshotReverted { .. } => EventCategory::Snapshot,
        }
    }
}

/// One entry of the control-plane event feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmEvent {
    /// Feed sequence number.
    pub sequence: Sequence,
    /// Affected VM (weak reference; may outlive the VM's tombstone).
    pub vm_id: VmId,
    /// VM revision after the change.
    pub revision: Revision,
    /// When the control plane recorded the change.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl VmEvent {
    /// Returns the event kind as a static string slice.
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self.kind {
            EventKind::PowerChanged { .. } => "power_changed",
            EventKind::Created { .. } => "created",
            EventKind::Deleted => "deleted",
            EventKind::SnapshotCreated { .. } => "snapshot_created",
            EventKind::SnapshotRemoved { .. } => "snapshot_removed",
            EventKind::SnapshotReverted { .. } => "snapshot_reverted",
        }
    }
}
