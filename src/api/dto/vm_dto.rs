//! VM DTOs for create, list, power, and clone requests.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::control_plane::{CloneSource, CloneSpec, VmSpec};
use crate::domain::{SnapshotId, VmId, VmRecord};
use crate::service::Operation;

/// Request body for `POST /vms`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateVmRequest {
    /// VM name, unique among live VMs.
    pub name: String,
    /// Virtual CPU count.
    pub vcpus: u32,
    /// Memory size in MiB.
    pub memory_mib: u64,
    /// Guest OS identifier.
    #[serde(default)]
    pub guest_id: Option<String>,
    /// Preferred host.
    #[serde(default)]
    pub host: Option<String>,
    /// Preferred datastore.
    #[serde(default)]
    pub datastore: Option<String>,
}

impl From<CreateVmRequest> for VmSpec {
    fn from(req: CreateVmRequest) -> Self {
        Self {
            name: req.name,
            vcpus: req.vcpus,
            memory_mib: req.memory_mib,
            guest_id: req.guest_id.unwrap_or_else(|| "otherGuest".to_string()),
            host: req.host,
            datastore: req.datastore,
        }
    }
}

/// Power actions accepted by `POST /vms/{id}/power`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    /// Power on or resume.
    On,
    /// Power off.
    Off,
    /// Suspend.
    Suspend,
    /// Power off, then on.
    Reboot,
}

/// Request body for `POST /vms/{id}/power`.
#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
pub struct PowerRequest {
    /// Requested action.
    pub action: PowerAction,
}

impl PowerRequest {
    /// Builds the orchestrator operation for `vm_id`.
    #[must_use]
    pub fn into_operation(self, vm_id: VmId) -> Operation {
        match self.action {
            PowerAction::On => Operation::PowerOn { vm_id },
            PowerAction::Off => Operation::PowerOff { vm_id },
            PowerAction::Suspend => Operation::Suspend { vm_id },
            PowerAction::Reboot => Operation::Reboot { vm_id },
        }
    }
}

/// Request body for `POST /vms/{id}/clone`.
///
/// Without `snapshot_id` the path VM must be a template; with it, the clone
/// starts from that snapshot of the path VM.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CloneVmRequest {
    /// Name of the new VM.
    pub name: String,
    /// Power the clone on once created.
    #[serde(default)]
    pub power_on: bool,
    /// Snapshot to clone from.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub snapshot_id: Option<SnapshotId>,
    /// Host to place the clone on (defaults to the source's host).
    #[serde(default)]
    pub host: Option<String>,
    /// Datastore for the clone (defaults to the source's datastore).
    #[serde(default)]
    pub datastore: Option<String>,
}

impl CloneVmRequest {
    /// Builds the orchestrator operation cloning from `vm_id`.
    #[must_use]
    pub fn into_operation(self, vm_id: VmId) -> Operation {
        let source = match self.snapshot_id {
            Some(snapshot_id) => CloneSource::Snapshot { vm_id, snapshot_id },
            None => CloneSource::Template { template: vm_id },
        };
        Operation::Clone {
            source,
            spec: CloneSpec {
                name: self.name,
                power_on: self.power_on,
                host: self.host,
                datastore: self.datastore,
            },
        }
    }
}

/// Response body for `GET /vms`.
#[derive(Debug, Serialize, ToSchema)]
pub struct VmListResponse {
    /// Matching records, ordered by VM id.
    pub data: Vec<VmRecord>,
    /// Number of records returned.
    pub count: usize,
}
