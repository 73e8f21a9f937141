//! Snapshot handlers: tree, create, delete, revert, compare.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use super::operation::submit;
use crate::api::dto::{CreateSnapshotRequest, OperationAccepted, SnapshotTreeResponse, SubmitParams};
use crate::app_state::AppState;
use crate::domain::{ConfigComparison, SnapshotId, VmId};
use crate::error::{ErrorResponse, OrchestratorError};
use crate::service::{Operation, OperationOutcome};

/// `GET /vms/:id/snapshots`: Snapshot tree of a VM.
///
/// # Errors
///
/// Returns [`OrchestratorError::VmNotFound`] if the VM is unknown.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/snapshots",
    tag = "Snapshots",
    summary = "Get snapshot tree",
    description = "Returns every snapshot of the VM with parent links and the active pointer.",
    params(
        ("id" = String, Path, description = "VM identifier"),
    ),
    responses(
        (status = 200, description = "Snapshot tree", body = SnapshotTreeResponse),
        (status = 404, description = "VM not found", body = ErrorResponse),
    )
)]
pub async fn get_snapshots(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let tree = state.orchestrator.snapshot_tree(&VmId::from(id)).await?;
    Ok(Json(SnapshotTreeResponse::from(&tree)))
}

/// `POST /vms/:id/snapshots`: Capture a snapshot.
///
/// # Errors
///
/// Returns [`OrchestratorError`] when `wait=true` and the capture fails.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/snapshots",
    tag = "Snapshots",
    summary = "Create a snapshot",
    description = "Captures a snapshot as a child of the active snapshot. The VM must be powered on or off.",
    params(
        ("id" = String, Path, description = "VM identifier"),
        SubmitParams,
    ),
    request_body = CreateSnapshotRequest,
    responses(
        (status = 201, description = "Snapshot created (wait=true)", body = OperationOutcome),
        (status = 202, description = "Capture accepted", body = OperationAccepted),
        (status = 422, description = "VM in a state that cannot be snapshotted", body = ErrorResponse),
    )
)]
pub async fn create_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SubmitParams>,
    Json(req): Json<CreateSnapshotRequest>,
) -> Result<Response, OrchestratorError> {
    let operation = Operation::SnapshotCreate {
        vm_id: VmId::from(id),
        spec: req.into(),
    };
    submit(&state, operation, params, StatusCode::CREATED).await
}

/// `DELETE /vms/:id/snapshots/:sid`: Remove a snapshot.
///
/// # Errors
///
/// Returns [`OrchestratorError`] when `wait=true` and the removal fails.
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}/snapshots/{sid}",
    tag = "Snapshots",
    summary = "Delete a snapshot",
    description = "Removes one snapshot. Its children are re-parented to its parent.",
    params(
        ("id" = String, Path, description = "VM identifier"),
        ("sid" = String, Path, description = "Snapshot identifier"),
        SubmitParams,
    ),
    responses(
        (status = 200, description = "Snapshot removed (wait=true)", body = OperationOutcome),
        (status = 202, description = "Removal accepted", body = OperationAccepted),
        (status = 404, description = "VM or snapshot not found", body = ErrorResponse),
    )
)]
pub async fn delete_snapshot(
    State(state): State<AppState>,
    Path((id, sid)): Path<(String, String)>,
    Query(params): Query<SubmitParams>,
) -> Result<Response, OrchestratorError> {
    let operation = Operation::SnapshotDelete {
        vm_id: VmId::from(id),
        snapshot_id: SnapshotId::from(sid),
    };
    submit(&state, operation, params, StatusCode::OK).await
}

/// `POST /vms/:id/snapshots/:sid/revert`: Revert to a snapshot.
///
/// # Errors
///
/// Returns [`OrchestratorError`] when `wait=true` and the revert fails.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/snapshots/{sid}/revert",
    tag = "Snapshots",
    summary = "Revert to a snapshot",
    description = "Restores the VM to the snapshot and leaves it in the power state the snapshot recorded.",
    params(
        ("id" = String, Path, description = "VM identifier"),
        ("sid" = String, Path, description = "Snapshot identifier"),
        SubmitParams,
    ),
    responses(
        (status = 200, description = "Revert finished (wait=true)", body = OperationOutcome),
        (status = 202, description = "Revert accepted", body = OperationAccepted),
        (status = 404, description = "VM or snapshot not found", body = ErrorResponse),
    )
)]
pub async fn revert_snapshot(
    State(state): State<AppState>,
    Path((id, sid)): Path<(String, String)>,
    Query(params): Query<SubmitParams>,
) -> Result<Response, OrchestratorError> {
    let operation = Operation::SnapshotRevert {
        vm_id: VmId::from(id),
        snapshot_id: SnapshotId::from(sid),
    };
    submit(&state, operation, params, StatusCode::OK).await
}

/// `GET /vms/:id/snapshots/:sid/compare`: Current vs. snapshot allocation.
///
/// # Errors
///
/// Returns [`OrchestratorError::VmNotFound`] or
/// [`OrchestratorError::SnapshotNotFound`].
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}/snapshots/{sid}/compare",
    tag = "Snapshots",
    summary = "Compare with a snapshot",
    description = "Reports vCPU and memory deltas between the VM's current allocation and the snapshot's.",
    params(
        ("id" = String, Path, description = "VM identifier"),
        ("sid" = String, Path, description = "Snapshot identifier"),
    ),
    responses(
        (status = 200, description = "Configuration comparison", body = ConfigComparison),
        (status = 404, description = "VM or snapshot not found", body = ErrorResponse),
    )
)]
pub async fn compare_snapshot(
    State(state): State<AppState>,
    Path((id, sid)): Path<(String, String)>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let comparison = state
        .orchestrator
        .compare(&VmId::from(id), &SnapshotId::from(sid))
        .await?;
    Ok(Json(comparison))
}

/// Snapshot routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/vms/{id}/snapshots", get(get_snapshots).post(create_snapshot))
        .route("/vms/{id}/snapshots/{sid}", delete(delete_snapshot))
        .route("/vms/{id}/snapshots/{sid}/revert", post(revert_snapshot))
        .route("/vms/{id}/snapshots/{sid}/compare", get(compare_snapshot))
}
