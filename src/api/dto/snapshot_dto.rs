//! Snapshot DTOs.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::control_plane::SnapshotSpec;
use crate::domain::{SnapshotId, SnapshotNode, SnapshotTree, VmId};

/// Request body for `POST /vms/{id}/snapshots`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateSnapshotRequest {
    /// Snapshot name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

impl From<CreateSnapshotRequest> for SnapshotSpec {
    fn from(req: CreateSnapshotRequest) -> Self {
        Self {
            name: req.name,
            description: req.description,
        }
    }
}

/// Response body for `GET /vms/{id}/snapshots`.
#[derive(Debug, Serialize, ToSchema)]
pub struct SnapshotTreeResponse {
    /// Owning VM.
    #[schema(value_type = String)]
    pub vm_id: VmId,
    /// Snapshot the VM currently runs from.
    #[schema(value_type = Option<String>)]
    pub active: Option<SnapshotId>,
    /// Quarantine reason; snapshot operations are refused while set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined: Option<String>,
    /// All nodes, parents before children.
    pub nodes: Vec<SnapshotNode>,
}

impl From<&SnapshotTree> for SnapshotTreeResponse {
    fn from(tree: &SnapshotTree) -> Self {
        let listing = tree.listing();
        Self {
            vm_id: tree.vm_id().clone(),
            active: listing.active,
            quarantined: tree.quarantine_reason().map(str::to_string),
            nodes: listing.nodes,
        }
    }
}
