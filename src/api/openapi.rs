//! `OpenAPI` (3.1) document for the REST surface.

use utoipa::OpenApi;

/// `OpenAPI` documentation for `/api/v1/*` and `/health`.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "vm-orchestrator API",
        version = env!("CARGO_PKG_VERSION"),
        description = "VM lifecycle and snapshot orchestration"
    ),
    paths(
        crate::api::handlers::vm::list_vms,
        crate::api::handlers::vm::create_vm,
        crate::api::handlers::vm::get_vm,
        crate::api::handlers::vm::delete_vm,
        crate::api::handlers::vm::power_vm,
        crate::api::handlers::vm::mark_template,
        crate::api::handlers::vm::clone_vm,
        crate::api::handlers::snapshot::get_snapshots,
        crate::api::handlers::snapshot::create_snapshot,
        crate::api::handlers::snapshot::delete_snapshot,
        crate::api::handlers::snapshot::revert_snapshot,
        crate::api::handlers::snapshot::compare_snapshot,
        crate::api::handlers::operation::get_operation,
        crate::api::handlers::operation::cancel_operation,
        crate::api::handlers::inventory::list_hosts,
        crate::api::handlers::inventory::list_datastores,
        crate::api::handlers::event::recent_events,
        crate::api::handlers::system::health_handler,
    ),
    components(
        schemas(
            crate::error::ErrorResponse,
            crate::domain::VmRecord,
            crate::domain::PowerState,
            crate::domain::SnapshotNode,
            crate::domain::ConfigComparison,
            crate::api::dto::CreateVmRequest,
            crate::api::dto::PowerRequest,
            crate::api::dto::PowerAction,
            crate::api::dto::CloneVmRequest,
            crate::api::dto::CreateSnapshotRequest,
            crate::api::dto::OperationAccepted,
            crate::api::dto::OperationStatusResponse,
            crate::api::dto::CancelResponse,
            crate::api::dto::RecentEvent,
            crate::domain::EventCategory,
        )
    ),
    tags(
        (name = "VMs", description = "VM records and lifecycle operations"),
        (name = "Snapshots", description = "Snapshot tree operations"),
        (name = "Operations", description = "Submitted operation tracking"),
        (name = "Inventory", description = "Host and datastore reports"),
        (name = "Events", description = "Recent control-plane events"),
        (name = "System", description = "Service health"),
    )
)]
pub struct ApiDoc;

/// Returns the generated `OpenAPI` document as pretty JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}
