//! Recent control-plane events observed by the monitor.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::{RecentEvent, RecentEventsParams};
use crate::app_state::AppState;

/// `GET /events`: Most recent feed events, newest first.
#[utoipa::path(
    get,
    path = "/api/v1/events",
    tag = "Events",
    summary = "List recent events",
    description = "Returns the most recent control-plane events admitted by the event monitor, newest first. `kind=power` restricts the list to power-on, power-off, and suspend events.",
    params(RecentEventsParams),
    responses(
        (status = 200, description = "Recent events", body = Vec<RecentEvent>),
        (status = 400, description = "Unknown kind"),
    )
)]
pub async fn recent_events(
    State(state): State<AppState>,
    Query(params): Query<RecentEventsParams>,
) -> impl IntoResponse {
    let events = state
        .monitor
        .recent_events(params.limit(), params.kind)
        .await;
    Json(events.into_iter().map(RecentEvent::from).collect::<Vec<_>>())
}

/// Event routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/events", get(recent_events))
}
