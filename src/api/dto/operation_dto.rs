//! Operation tracking DTOs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{OperationId, VmId};
use crate::error::ErrorBody;
use crate::service::{OperationHandle, OperationOutcome, OperationStatus};

/// Response body for `202 Accepted` operation submissions.
#[derive(Debug, Serialize, ToSchema)]
pub struct OperationAccepted {
    /// Identifier to poll or cancel.
    #[schema(value_type = uuid::Uuid)]
    pub operation_id: OperationId,
    /// Operation name.
    pub operation: String,
    /// Targeted VM, if any.
    #[schema(value_type = Option<String>)]
    pub vm_id: Option<VmId>,
    /// Relative URL of the status resource.
    pub status_url: String,
}

impl From<&OperationHandle> for OperationAccepted {
    fn from(handle: &OperationHandle) -> Self {
        Self {
            operation_id: handle.id(),
            operation: handle.name().to_string(),
            vm_id: handle.target().cloned(),
            status_url: format!("/api/v1/operations/{}", handle.id()),
        }
    }
}

/// Response body for `GET /operations/{id}`.
#[derive(Debug, Serialize, ToSchema)]
pub struct OperationStatusResponse {
    /// Operation identifier.
    #[schema(value_type = uuid::Uuid)]
    pub operation_id: OperationId,
    /// Operation name.
    pub operation: String,
    /// Targeted VM, if any.
    #[schema(value_type = Option<String>)]
    pub vm_id: Option<VmId>,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// `running`, `succeeded`, `failed`, or `cancelled`.
    pub status: String,
    /// Result of a successful operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OperationOutcome>,
    /// Failure of an unsuccessful operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl From<&OperationHandle> for OperationStatusResponse {
    fn from(handle: &OperationHandle) -> Self {
        let status = handle.poll();
        let (outcome, error) = match &status {
            OperationStatus::Succeeded(outcome) => (Some(outcome.clone()), None),
            OperationStatus::Failed(err) => (None, Some(ErrorBody::from(err))),
            OperationStatus::Running | OperationStatus::Cancelled => (None, None),
        };
        Self {
            operation_id: handle.id(),
            operation: handle.name().to_string(),
            vm_id: handle.target().cloned(),
            submitted_at: handle.submitted_at(),
            status: status.as_str().to_string(),
            outcome,
            error,
        }
    }
}

/// Response body for `DELETE /operations/{id}`.
#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    /// Operation identifier.
    #[schema(value_type = uuid::Uuid)]
    pub operation_id: OperationId,
    /// `false` if the operation had already finished.
    pub cancellation_requested: bool,
}
