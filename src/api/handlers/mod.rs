//! REST endpoint handlers organized by resource.

pub mod event;
pub mod inventory;
pub mod operation;
pub mod snapshot;
pub mod system;
pub mod vm;

use axum::Router;

use crate::app_state::AppState;

/// Composes all resource routes under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(vm::routes())
        .merge(snapshot::routes())
        .merge(operation::routes())
        .merge(inventory::routes())
        .merge(event::routes())
}
