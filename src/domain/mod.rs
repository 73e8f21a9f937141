//! Domain layer: identifiers, VM records, snapshot trees, and notifications.
//!
//! This module contains the engine's state model: the [`VmStateStore`]
//! cache of VM records, the per-VM [`SnapshotTree`]s held by the
//! [`SnapshotRegistry`], the control-plane [`VmEvent`] feed types, and the
//! [`EventBus`] carrying [`VmChange`] notifications to subscribers.

pub mod event_bus;
pub mod ids;
pub mod inventory;
pub mod snapshot_registry;
pub mod snapshot_tree;
pub mod state_store;
pub mod vm_change;
pub mod vm_event;
pub mod vm_record;

pub use event_bus::EventBus;
pub use ids::{OperationId, SnapshotId, VmId};
pub use inventory::{DatastoreUsage, HostHealth};
pub use snapshot_registry::SnapshotRegistry;
pub use snapshot_tree::{
    ConfigComparison, NewSnapshot, SnapshotCloneRequest, SnapshotListing, SnapshotNode,
    SnapshotTree,
};
pub use state_store::{UpsertOutcome, VmFilter, VmStateStore};
pub use vm_change::VmChange;
pub use vm_event::{EventCategory, EventKind, Sequence, VmEvent};
pub use vm_record::{PowerState, Resources, Revision, VmRecord};
