//! Orchestrator error taxonomy with HTTP status code mapping.
//!
//! [`OrchestratorError`] is the central error type of the crate. Every
//! VM-scoped variant carries the VM identifier and the last-known-good
//! [`PowerState`] so that a rejected operation is never a bare failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{PowerState, SnapshotId, VmId};

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2003,
///     "message": "vm-1 is busy with another operation",
///     "details": { "vm_id": "vm-1", "last_known_state": "on" }
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`OrchestratorError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// VM context for VM-scoped failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// VM context attached to VM-scoped error responses.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorDetails {
    /// VM the failed operation targeted.
    #[schema(value_type = String)]
    pub vm_id: VmId,
    /// Last power state the orchestrator trusted before the failure.
    pub last_known_state: Option<PowerState>,
}

/// Orchestrator error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category              | HTTP Status                  |
/// |-----------|-----------------------|------------------------------|
/// | 1000–1999 | Validation            | 400 Bad Request              |
/// | 2000–2999 | State / Not Found     | 404 / 409 / 422              |
/// | 3000–3999 | Server / Consistency  | 500 Internal Server Error    |
/// | 4000–4999 | Control Plane         | 502 / 504                    |
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    /// VM with the given ID is unknown (or already purged).
    #[error("vm not found: {0}")]
    VmNotFound(VmId),

    /// Snapshot is absent from the VM's tree.
    #[error("snapshot {snapshot_id} not found for {vm_id}")]
    SnapshotNotFound {
        /// Owning VM.
        vm_id: VmId,
        /// Missing snapshot.
        snapshot_id: SnapshotId,
        /// Power state of the VM when the lookup failed.
        last_known: Option<PowerState>,
    },

    /// Precondition violated; no side effect occurred.
    #[error("cannot {operation} {vm_id} while {state}")]
    InvalidState {
        /// Target VM.
        vm_id: VmId,
        /// Operation name (e.g. `"power_on"`).
        operation: &'static str,
        /// State that violated the precondition.
        state: PowerState,
    },

    /// Another operation holds the VM's exclusion token.
    #[error("{vm_id} is busy with another operation")]
    Conflict {
        /// Contended VM.
        vm_id: VmId,
        /// Power state observed when the conflict was detected.
        last_known: Option<PowerState>,
    },

    /// The control plane refused the request (permission, validation, gone).
    #[error("control plane rejected operation on {vm_id}: {reason}")]
    OperationRejected {
        /// Target VM.
        vm_id: VmId,
        /// Control-plane supplied reason.
        reason: String,
        /// Power state before the operation was attempted.
        last_known: Option<PowerState>,
    },

    /// Transient failures exhausted the retry budget; the VM is now `Stale`.
    #[error("operation on {vm_id} timed out after {attempts} attempts")]
    OperationTimedOut {
        /// Target VM.
        vm_id: VmId,
        /// Number of attempts made.
        attempts: u32,
        /// Power state before the operation was attempted.
        last_known: Option<PowerState>,
    },

    /// Internal consistency fault in a snapshot tree; the tree is quarantined.
    #[error("invariant violation in snapshot tree of {vm_id}: {detail}")]
    InvariantViolation {
        /// VM whose tree is affected.
        vm_id: VmId,
        /// What the check found.
        detail: String,
    },

    /// The operation was cancelled before it dispatched another request.
    #[error("operation on {vm_id} cancelled")]
    Cancelled {
        /// Target VM.
        vm_id: VmId,
        /// Power state at the time of cancellation.
        last_known: Option<PowerState>,
    },

    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operation handle with the given ID is unknown.
    #[error("operation not found: {0}")]
    OperationNotFound(uuid::Uuid),

    /// Checkpoint persistence failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::VmNotFound(_) => 2001,
            Self::SnapshotNotFound { .. } => 2002,
            Self::Conflict { .. } => 2003,
            Self::InvalidState { .. } => 2004,
            Self::Cancelled { .. } => 2005,
            Self::OperationNotFound(_) => 2006,
            Self::Internal(_) => 3000,
            Self::Persistence(_) => 3001,
            Self::InvariantViolation { .. } => 3002,
            Self::OperationRejected { .. } => 4001,
            Self::OperationTimedOut { .. } => 4002,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::VmNotFound(_) | Self::SnapshotNotFound { .. } | Self::OperationNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Conflict { .. } | Self::Cancelled { .. } => StatusCode::CONFLICT,
            Self::InvalidState { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Persistence(_) | Self::Internal(_) | Self::InvariantViolation { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::OperationRejected { .. } => StatusCode::BAD_GATEWAY,
            Self::OperationTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Returns the VM this error is scoped to, if any.
    #[must_use]
    pub fn vm_id(&self) -> Option<&VmId> {
        match self {
            Self::VmNotFound(vm_id)
            | Self::SnapshotNotFound { vm_id, .. }
            | Self::InvalidState { vm_id, .. }
            | Self::Conflict { vm_id, .. }
            | Self::OperationRejected { vm_id, .. }
            | Self::OperationTimedOut { vm_id, .. }
            | Self::InvariantViolation { vm_id, .. }
            | Self::Cancelled { vm_id, .. } => Some(vm_id),
            Self::InvalidRequest(_)
            | Self::OperationNotFound(_)
            | Self::Persistence(_)
            | Self::Internal(_) => None,
        }
    }

    /// Fills in the last-known state on variants that carry one but were
    /// raised without VM context (e.g. by a snapshot tree lookup).
    #[must_use]
    pub fn with_last_known(mut self, state: PowerState) -> Self {
        match &mut self {
            Self::SnapshotNotFound { last_known, .. }
            | Self::Conflict { last_known, .. }
            | Self::OperationRejected { last_known, .. }
            | Self::OperationTimedOut { last_known, .. }
            | Self::Cancelled { last_known, .. } => {
                last_known.get_or_insert(state);
            }
            _ => {}
        }
        self
    }

    /// Returns the last-known-good power state carried by this error.
    #[must_use]
    pub const fn last_known_state(&self) -> Option<PowerState> {
        match self {
            Self::InvalidState { state, .. } => Some(*state),
            Self::SnapshotNotFound { last_known, .. }
            | Self::Conflict { last_known, .. }
            | Self::OperationRejected { last_known, .. }
            | Self::OperationTimedOut { last_known, .. }
            | Self::Cancelled { last_known, .. } => *last_known,
            _ => None,
        }
    }
}

impl From<&OrchestratorError> for ErrorBody {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            code: err.error_code(),
            message: err.to_string(),
            details: err.vm_id().map(|vm_id| ErrorDetails {
                vm_id: vm_id.clone(),
                last_known_state: err.last_known_state(),
            }),
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody::from(&self),
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409_with_context() {
        let err = OrchestratorError::Conflict {
            vm_id: VmId::from("vm-1"),
            last_known: Some(PowerState::On),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.last_known_state(), Some(PowerState::On));
        assert_eq!(err.vm_id(), Some(&VmId::from("vm-1")));
    }

    #[test]
    fn invalid_state_reports_offending_state() {
        let err = OrchestratorError::InvalidState {
            vm_id: VmId::from("vm-2"),
            operation: "suspend",
            state: PowerState::Off,
        };
        assert_eq!(err.error_code(), 2004);
        assert_eq!(err.last_known_state(), Some(PowerState::Off));
        assert_eq!(err.to_string(), "cannot suspend vm-2 while off");
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = OrchestratorError::OperationTimedOut {
            vm_id: VmId::from("vm-3"),
            attempts: 5,
            last_known: Some(PowerState::Off),
        };
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn request_errors_have_no_vm_context() {
        let err = OrchestratorError::InvalidRequest("bad".to_string());
        assert!(err.vm_id().is_none());
        assert!(err.last_known_state().is_none());
    }
}
