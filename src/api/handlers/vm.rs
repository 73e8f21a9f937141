//! VM handlers: list, create, get, delete, power, template, clone.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::operation::submit;
use crate::api::dto::{
    CloneVmRequest, CreateVmRequest, OperationAccepted, PowerRequest, SubmitParams, VmListResponse,
};
use crate::app_state::AppState;
use crate::domain::{VmFilter, VmId, VmRecord};
use crate::error::{ErrorResponse, OrchestratorError};
use crate::service::{Operation, OperationOutcome};

/// `GET /vms`: List cached VM records.
#[utoipa::path(
    get,
    path = "/api/v1/vms",
    tag = "VMs",
    summary = "List VMs",
    description = "Returns cached VM records matching the filter. Tombstones of deleted VMs are excluded unless `include_deleted=true`.",
    params(VmFilter),
    responses(
        (status = 200, description = "Matching VMs", body = VmListResponse),
    )
)]
pub async fn list_vms(
    State(state): State<AppState>,
    Query(filter): Query<VmFilter>,
) -> impl IntoResponse {
    let data = state.store().list(&filter).await;
    Json(VmListResponse {
        count: data.len(),
        data,
    })
}

/// `POST /vms`: Create a powered-off VM.
///
/// # Errors
///
/// Returns [`OrchestratorError`] when `wait=true` and the creation fails.
#[utoipa::path(
    post,
    path = "/api/v1/vms",
    tag = "VMs",
    summary = "Create a VM",
    description = "Creates a powered-off VM. Names must be unique among live VMs.",
    params(SubmitParams),
    request_body = CreateVmRequest,
    responses(
        (status = 201, description = "VM created (wait=true)", body = OperationOutcome),
        (status = 202, description = "Creation accepted", body = OperationAccepted),
        (status = 400, description = "Invalid or duplicate spec", body = ErrorResponse),
    )
)]
pub async fn create_vm(
    State(state): State<AppState>,
    Query(params): Query<SubmitParams>,
    Json(req): Json<CreateVmRequest>,
) -> Result<Response, OrchestratorError> {
    let operation = Operation::Create { spec: req.into() };
    submit(&state, operation, params, StatusCode::CREATED).await
}

/// `GET /vms/:id`: Get one VM record.
///
/// # Errors
///
/// Returns [`OrchestratorError::VmNotFound`] if the VM is unknown.
#[utoipa::path(
    get,
    path = "/api/v1/vms/{id}",
    tag = "VMs",
    summary = "Get a VM",
    description = "Returns the cached record of one VM, including tombstones within their grace period.",
    params(
        ("id" = String, Path, description = "VM identifier"),
    ),
    responses(
        (status = 200, description = "VM record", body = VmRecord),
        (status = 404, description = "VM not found", body = ErrorResponse),
    )
)]
pub async fn get_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let record = state.store().get(&VmId::from(id)).await?;
    Ok(Json(record))
}

/// `DELETE /vms/:id`: Destroy a VM.
///
/// # Errors
///
/// Returns [`OrchestratorError`] when `wait=true` and the deletion fails.
#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}",
    tag = "VMs",
    summary = "Delete a VM",
    description = "Destroys the VM; it stays visible as a `deleted` tombstone for the grace period. Deleting an already-deleted VM is a no-op.",
    params(
        ("id" = String, Path, description = "VM identifier"),
        SubmitParams,
    ),
    responses(
        (status = 200, description = "VM deleted (wait=true)", body = OperationOutcome),
        (status = 202, description = "Deletion accepted", body = OperationAccepted),
        (status = 404, description = "VM not found", body = ErrorResponse),
    )
)]
pub async fn delete_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SubmitParams>,
) -> Result<Response, OrchestratorError> {
    let operation = Operation::Delete {
        vm_id: VmId::from(id),
    };
    submit(&state, operation, params, StatusCode::OK).await
}

/// `POST /vms/:id/power`: Power on, off, suspend, or reboot.
///
/// # Errors
///
/// Returns [`OrchestratorError`] when `wait=true` and the action fails.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/power",
    tag = "VMs",
    summary = "Change power state",
    description = "Requesting the state a VM is already in succeeds as a no-op without contacting the control plane.",
    params(
        ("id" = String, Path, description = "VM identifier"),
        SubmitParams,
    ),
    request_body = PowerRequest,
    responses(
        (status = 200, description = "Action finished (wait=true)", body = OperationOutcome),
        (status = 202, description = "Action accepted", body = OperationAccepted),
        (status = 409, description = "VM busy", body = ErrorResponse),
        (status = 422, description = "Action invalid in current state", body = ErrorResponse),
    )
)]
pub async fn power_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SubmitParams>,
    Json(req): Json<PowerRequest>,
) -> Result<Response, OrchestratorError> {
    let operation = req.into_operation(VmId::from(id));
    submit(&state, operation, params, StatusCode::OK).await
}

/// `POST /vms/:id/template`: Convert a powered-off VM into a template.
///
/// # Errors
///
/// Returns [`OrchestratorError`] when `wait=true` and the conversion fails.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/template",
    tag = "VMs",
    summary = "Mark as template",
    description = "Templates can be cloned but not powered on or snapshotted.",
    params(
        ("id" = String, Path, description = "VM identifier"),
        SubmitParams,
    ),
    responses(
        (status = 200, description = "VM converted (wait=true)", body = OperationOutcome),
        (status = 202, description = "Conversion accepted", body = OperationAccepted),
        (status = 422, description = "VM not powered off", body = ErrorResponse),
    )
)]
pub async fn mark_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SubmitParams>,
) -> Result<Response, OrchestratorError> {
    let operation = Operation::MarkTemplate {
        vm_id: VmId::from(id),
    };
    submit(&state, operation, params, StatusCode::OK).await
}

/// `POST /vms/:id/clone`: Clone a template or one of the VM's snapshots.
///
/// # Errors
///
/// Returns [`OrchestratorError`] when `wait=true` and the clone fails.
#[utoipa::path(
    post,
    path = "/api/v1/vms/{id}/clone",
    tag = "VMs",
    summary = "Clone a VM",
    description = "Without `snapshot_id` the path VM must be a template. With it, the new VM starts from that snapshot and is powered on if the snapshot was taken while running.",
    params(
        ("id" = String, Path, description = "Source VM identifier"),
        SubmitParams,
    ),
    request_body = CloneVmRequest,
    responses(
        (status = 201, description = "Clone created (wait=true)", body = OperationOutcome),
        (status = 202, description = "Clone accepted", body = OperationAccepted),
        (status = 400, description = "Source is not a template or name taken", body = ErrorResponse),
        (status = 404, description = "VM or snapshot not found", body = ErrorResponse),
    )
)]
pub async fn clone_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SubmitParams>,
    Json(req): Json<CloneVmRequest>,
) -> Result<Response, OrchestratorError> {
    let operation = req.into_operation(VmId::from(id));
    submit(&state, operation, params, StatusCode::CREATED).await
}

/// VM routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/vms", get(list_vms).post(create_vm))
        .route("/vms/{id}", get(get_vm).delete(delete_vm))
        .route("/vms/{id}/power", post(power_vm))
        .route("/vms/{id}/template", post(mark_template))
        .route("/vms/{id}/clone", post(clone_vm))
}
