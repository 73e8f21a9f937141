//! Control-plane collaborator contract.
//!
//! The engine never talks to a virtualization API directly; it depends on the
//! [`ControlPlane`] trait, injected as `Arc<dyn ControlPlane>` into every
//! component that needs it. [`SimulatedControlPlane`] is an in-memory
//! implementation (in the spirit of `vcsim`) used by tests and by the binary
//! when no real endpoint is wired in.

pub mod simulator;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{
    DatastoreUsage, HostHealth, Revision, Sequence, SnapshotId, SnapshotListing, VmEvent, VmId,
    VmRecord,
};

pub use simulator::{Fault, SimulatedControlPlane};

/// Lazy, restartable feed of control-plane events.
pub type EventStream = BoxStream<'static, Result<VmEvent, ControlPlaneError>>;

/// Errors reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlPlaneError {
    /// No acknowledgment within the allotted time.
    #[error("control plane timed out")]
    Timeout,

    /// Request throttled.
    #[error("rate limited")]
    RateLimited {
        /// Server-suggested wait before retrying.
        retry_after: Option<Duration>,
    },

    /// Session lost or never established.
    #[error("control plane disconnected")]
    Disconnected,

    /// Entity does not exist on the control plane.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller lacks the privilege for the request.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Request refused as invalid in the current control-plane state.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ControlPlaneError {
    /// Returns `true` for failures worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited { .. } | Self::Disconnected
        )
    }
}

/// Power command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PowerOp {
    /// Power on (also resumes a suspended VM).
    On,
    /// Hard power off.
    Off,
    /// Suspend to memory.
    Suspend,
}

impl fmt::Display for PowerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Suspend => "suspend",
        })
    }
}

/// Control-plane acknowledgment of a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// VM revision after the task.
    pub revision: Revision,
}

/// Acknowledgment of a snapshot capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotAck {
    /// Identifier assigned to the new snapshot.
    pub snapshot_id: SnapshotId,
    /// VM revision after the task.
    pub revision: Revision,
}

/// Configuration of a VM to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VmSpec {
    /// VM name.
    pub name: String,
    /// Virtual CPU count.
    pub vcpus: u32,
    /// Memory size in MiB.
    pub memory_mib: u64,
    /// Guest OS identifier (e.g. `otherGuest`).
    #[serde(default = "default_guest_id")]
    pub guest_id: String,
    /// Preferred host; the control plane picks one if absent.
    #[serde(default)]
    pub host: Option<String>,
    /// Preferred datastore; the control plane picks one if absent.
    #[serde(default)]
    pub datastore: Option<String>,
}

fn default_guest_id() -> String {
    "otherGuest".to_string()
}

/// What a clone starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CloneSource {
    /// A VM marked as template.
    Template {
        /// Template VM.
        template: VmId,
    },
    /// A snapshot of an existing VM.
    Snapshot {
        /// VM owning the snapshot.
        vm_id: VmId,
        /// Snapshot to clone.
        snapshot_id: SnapshotId,
    },
}

impl CloneSource {
    /// VM the clone reads from.
    #[must_use]
    pub fn source_vm(&self) -> &VmId {
        match self {
            Self::Template { template } => template,
            Self::Snapshot { vm_id, .. } => vm_id,
        }
    }
}

/// Parameters of the VM produced by a clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CloneSpec {
    /// Name of the new VM.
    pub name: String,
    /// Power the clone on once created.
    #[serde(default)]
    pub power_on: bool,
    /// Host to place the clone on; the source's host when unset.
    #[serde(default)]
    pub host: Option<String>,
    /// Datastore for the clone's disks; the source's first datastore when
    /// unset.
    #[serde(default)]
    pub datastore: Option<String>,
}

/// Parameters of a snapshot to capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SnapshotSpec {
    /// Snapshot name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// Operations the engine consumes from the virtualization control plane.
///
/// Mutating calls return once the control plane acknowledges the task; the
/// caller bounds each call with its own timeout.
#[async_trait]
pub trait ControlPlane: Send + Sync + fmt::Debug {
    /// Establishes the session.
    async fn connect(&self) -> Result<(), ControlPlaneError>;

    /// Tears the session down.
    async fn disconnect(&self) -> Result<(), ControlPlaneError>;

    /// Lists every VM.
    async fn list_vms(&self) -> Result<Vec<VmRecord>, ControlPlaneError>;

    /// Fetches one VM.
    async fn get_vm(&self, id: &VmId) -> Result<VmRecord, ControlPlaneError>;

    /// Issues a power command.
    async fn power_op(&self, id: &VmId, op: PowerOp) -> Result<Ack, ControlPlaneError>;

    /// Creates a powered-off VM.
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmId, ControlPlaneError>;

    /// Destroys a VM.
    async fn delete_vm(&self, id: &VmId) -> Result<Ack, ControlPlaneError>;

    /// Clones a template or snapshot into a new powered-off VM.
    async fn clone_vm(
        &self,
        source: &CloneSource,
        spec: &CloneSpec,
    ) -> Result<VmId, ControlPlaneError>;

    /// Converts a VM into a template.
    async fn mark_template(&self, id: &VmId) -> Result<Ack, ControlPlaneError>;

    /// Captures a snapshot under the VM's current snapshot.
    async fn snapshot_create(
        &self,
        id: &VmId,
        spec: &SnapshotSpec,
    ) -> Result<SnapshotAck, ControlPlaneError>;

    /// Removes a snapshot, reparenting its children.
    async fn snapshot_delete(
        &self,
        id: &VmId,
        snapshot: &SnapshotId,
    ) -> Result<Ack, ControlPlaneError>;

    /// Reverts the VM's disks to a snapshot.
    async fn snapshot_revert(
        &self,
        id: &VmId,
        snapshot: &SnapshotId,
    ) -> Result<Ack, ControlPlaneError>;

    /// Returns the VM's full snapshot listing.
    async fn get_snapshot_tree(&self, id: &VmId) -> Result<SnapshotListing, ControlPlaneError>;

    /// Lists hypervisor hosts with health information.
    async fn list_hosts(&self) -> Result<Vec<HostHealth>, ControlPlaneError>;

    /// Lists datastores with capacity information.
    async fn list_datastores(&self) -> Result<Vec<DatastoreUsage>, ControlPlaneError>;

    /// Opens the event feed, yielding events with sequence numbers strictly
    /// greater than `since`. The stream ends when the session drops.
    fn subscribe_events(&self, since: Sequence) -> EventStream;
}
