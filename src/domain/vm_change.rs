//! Change notifications published after every successful store mutation.
//!
//! Every mutation of [`super::VmStateStore`] or a snapshot tree emits a
//! [`VmChange`] through the [`super::EventBus`]. Consumers (WebSocket
//! clients, report generators) treat them as fire-and-forget hints; per VM
//! they arrive in increasing revision order, across VMs in no set order.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{PowerState, Revision, SnapshotId, VmId, VmRecord};

/// Notification emitted after a state mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "change_type", rename_all = "snake_case")]
pub enum VmChange {
    /// A record was inserted or replaced.
    Upserted {
        /// New record contents.
        record: VmRecord,
        /// Notification timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Power state moved without a full record refresh.
    StateChanged {
        /// Affected VM.
        vm_id: VmId,
        /// Previous state.
        from: PowerState,
        /// New state.
        to: PowerState,
        /// Revision after the change.
        revision: Revision,
        /// Notification timestamp.
        timestamp: DateTime<Utc>,
    },

    /// VM entered the `Deleted` tombstone state.
    Deleted {
        /// Affected VM.
        vm_id: VmId,
        /// Revision after the change.
        revision: Revision,
        /// Notification timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Tombstone grace period expired; the record is gone.
    Purged {
        /// Affected VM.
        vm_id: VmId,
        /// Notification timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Snapshot tree structure or active pointer changed.
    SnapshotsChanged {
        /// Affected VM.
        vm_id: VmId,
        /// Active snapshot after the change.
        active: Option<SnapshotId>,
        /// Number of snapshots after the change.
        count: usize,
        /// Notification timestamp.
        timestamp: DateTime<Utc>,
    },

    /// Snapshot tree quarantined after an invariant violation.
    SnapshotsQuarantined {
        /// Affected VM.
        vm_id: VmId,
        /// Violation description.
        reason: String,
        /// Notification timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl VmChange {
    /// Returns the VM this notification concerns.
    #[must_use]
    pub fn vm_id(&self) -> &VmId {
        match self {
            Self::Upserted { record, .. } => &record.id,
            Self::StateChanged { vm_id, .. }
            | Self::Deleted { vm_id, .. }
            | Self::Purged { vm_id, .. }
            | Self::SnapshotsChanged { vm_id, .. }
            | Self::SnapshotsQuarantined { vm_id, .. } => vm_id,
        }
    }

    /// Returns the change type as a static string slice.
    #[must_use]
    pub const fn change_type_str(&self) -> &'static str {
        match self {
            Self::Upserted { .. } => "upserted",
            Self::StateChanged { .. } => "state_changed",
            Self::Deleted { .. } => "deleted",
            Self::Purged { .. } => "purged",
            Self::SnapshotsChanged { .. } => "snapshots_changed",
            Self::SnapshotsQuarantined { .. } => "snapshots_quarantined",
        }
    }
}
