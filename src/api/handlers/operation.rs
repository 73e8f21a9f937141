//! Operation submission, status, and cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::{CancelResponse, OperationAccepted, OperationStatusResponse, SubmitParams};
use crate::app_state::AppState;
use crate::domain::OperationId;
use crate::error::{ErrorResponse, OrchestratorError};
use crate::service::Operation;

/// Runs or queues `operation` according to `params`.
///
/// With `wait=true` the outcome is returned with `done`; otherwise the
/// operation runs in the background and `202 Accepted` carries its id.
pub(crate) async fn submit(
    state: &AppState,
    operation: Operation,
    params: SubmitParams,
    done: StatusCode,
) -> Result<Response, OrchestratorError> {
    if params.wait {
        let outcome = state.orchestrator.execute(operation, params.mode()).await?;
        return Ok((done, Json(outcome)).into_response());
    }
    let handle = state.orchestrator.submit(operation, params.mode()).await;
    Ok((StatusCode::ACCEPTED, Json(OperationAccepted::from(&handle))).into_response())
}

/// `GET /operations/:id`: Operation status.
///
/// # Errors
///
/// Returns [`OrchestratorError::OperationNotFound`] for unknown ids.
#[utoipa::path(
    get,
    path = "/api/v1/operations/{id}",
    tag = "Operations",
    summary = "Get operation status",
    description = "Returns the status of a submitted operation and, once finished, its outcome or error.",
    params(
        ("id" = uuid::Uuid, Path, description = "Operation UUID"),
    ),
    responses(
        (status = 200, description = "Operation status", body = OperationStatusResponse),
        (status = 404, description = "Operation not found", body = ErrorResponse),
    )
)]
pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let handle = state
        .orchestrator
        .operation(OperationId::from_uuid(id))
        .await?;
    Ok(Json(OperationStatusResponse::from(&handle)))
}

/// `DELETE /operations/:id`: Request cancellation.
///
/// # Errors
///
/// Returns [`OrchestratorError::OperationNotFound`] for unknown ids.
#[utoipa::path(
    delete,
    path = "/api/v1/operations/{id}",
    tag = "Operations",
    summary = "Cancel an operation",
    description = "Stops a running operation before its next control-plane attempt. A VM with a dispatched attempt is left stale until the event feed or reconciliation settles it.",
    params(
        ("id" = uuid::Uuid, Path, description = "Operation UUID"),
    ),
    responses(
        (status = 202, description = "Cancellation recorded", body = CancelResponse),
        (status = 404, description = "Operation not found", body = ErrorResponse),
    )
)]
pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let handle = state
        .orchestrator
        .operation(OperationId::from_uuid(id))
        .await?;
    let response = CancelResponse {
        operation_id: handle.id(),
        cancellation_requested: handle.cancel(),
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Operation tracking routes.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/operations/{id}",
        get(get_operation).delete(cancel_operation),
    )
}
