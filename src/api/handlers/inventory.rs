//! Read-through inventory reports.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::{DatastoreReport, HostReport};
use crate::app_state::AppState;
use crate::error::{ErrorResponse, OrchestratorError};

/// `GET /hosts`: Host health report.
///
/// # Errors
///
/// Returns [`OrchestratorError::Internal`] if the control plane cannot be
/// read.
#[utoipa::path(
    get,
    path = "/api/v1/hosts",
    tag = "Inventory",
    summary = "List hosts",
    description = "Reads hardware, connection, and health status of every host from the control plane.",
    responses(
        (status = 200, description = "Host report", body = Vec<HostReport>),
        (status = 500, description = "Control plane unavailable", body = ErrorResponse),
    )
)]
pub async fn list_hosts(State(state): State<AppState>) -> Result<impl IntoResponse, OrchestratorError> {
    let hosts = state.orchestrator.list_hosts().await?;
    Ok(Json(
        hosts.into_iter().map(HostReport::from).collect::<Vec<_>>(),
    ))
}

/// `GET /datastores`: Datastore usage report.
///
/// # Errors
///
/// Returns [`OrchestratorError::Internal`] if the control plane cannot be
/// read.
#[utoipa::path(
    get,
    path = "/api/v1/datastores",
    tag = "Inventory",
    summary = "List datastores",
    description = "Reads capacity and free space of every datastore from the control plane.",
    responses(
        (status = 200, description = "Datastore report", body = Vec<DatastoreReport>),
        (status = 500, description = "Control plane unavailable", body = ErrorResponse),
    )
)]
pub async fn list_datastores(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let datastores = state.orchestrator.list_datastores().await?;
    Ok(Json(
        datastores
            .into_iter()
            .map(DatastoreReport::from)
            .collect::<Vec<_>>(),
    ))
}

/// Inventory routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/hosts", get(list_hosts))
        .route("/datastores", get(list_datastores))
}
