//! Operations accepted by the orchestrator and the handles tracking them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::control_plane::{CloneSource, CloneSpec, SnapshotSpec, VmSpec};
use crate::domain::{OperationId, PowerState, SnapshotId, VmId};
use crate::error::OrchestratorError;

/// Lifecycle or snapshot operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Power a VM on (resumes a suspended VM).
    PowerOn {
        /// Target VM.
        vm_id: VmId,
    },
    /// Power a VM off.
    PowerOff {
        /// Target VM.
        vm_id: VmId,
    },
    /// Suspend a running VM.
    Suspend {
        /// Target VM.
        vm_id: VmId,
    },
    /// Power a running VM off and on again.
    Reboot {
        /// Target VM.
        vm_id: VmId,
    },
    /// Destroy a VM.
    Delete {
        /// Target VM.
        vm_id: VmId,
    },
    /// Create a powered-off VM.
    Create {
        /// Configuration of the new VM.
        spec: VmSpec,
    },
    /// Clone a template or snapshot into a new VM.
    Clone {
        /// What to clone.
        source: CloneSource,
        /// New VM parameters.
        spec: CloneSpec,
    },
    /// Convert a powered-off VM into a template.
    MarkTemplate {
        /// Target VM.
        vm_id: VmId,
    },
    /// Capture a snapshot.
    SnapshotCreate {
        /// Target VM.
        vm_id: VmId,
        /// Snapshot parameters.
        spec: SnapshotSpec,
    },
    /// Remove a snapshot.
    SnapshotDelete {
        /// Target VM.
        vm_id: VmId,
        /// Snapshot to remove.
        snapshot_id: SnapshotId,
    },
    /// Revert a VM to a snapshot.
    SnapshotRevert {
        /// Target VM.
        vm_id: VmId,
        /// Snapshot to revert to.
        snapshot_id: SnapshotId,
    },
}

impl Operation {
    /// Returns the operation name as a static string slice.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PowerOn { .. } => "power_on",
            Self::PowerOff { .. } => "power_off",
            Self::Suspend { .. } => "suspend",
            Self::Reboot { .. } => "reboot",
            Self::Delete { .. } => "delete",
            Self::Create { .. } => "create",
            Self::Clone { .. } => "clone",
            Self::MarkTemplate { .. } => "mark_template",
            Self::SnapshotCreate { .. } => "snapshot_create",
            Self::SnapshotDelete { .. } => "snapshot_delete",
            Self::SnapshotRevert { .. } => "snapshot_revert",
        }
    }

    /// Returns the existing VM the operation targets (the source for clones).
    #[must_use]
    pub fn target(&self) -> Option<&VmId> {
        match self {
            Self::PowerOn { vm_id }
            | Self::PowerOff { vm_id }
            | Self::Suspend { vm_id }
            | Self::Reboot { vm_id }
            | Self::Delete { vm_id }
            | Self::MarkTemplate { vm_id }
            | Self::SnapshotCreate { vm_id, .. }
            | Self::SnapshotDelete { vm_id, .. }
            | Self::SnapshotRevert { vm_id, .. } => Some(vm_id),
            Self::Clone { source, .. } => Some(source.source_vm()),
            Self::Create { .. } => None,
        }
    }
}

/// How a submission behaves when the VM is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubmitMode {
    /// Wait for the VM's token (bounded by the lock wait timeout).
    #[default]
    Wait,
    /// Fail with a conflict immediately.
    FailFast,
}

/// Result of a successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OperationOutcome {
    /// VM the operation left behind (the new VM for create and clone).
    #[schema(value_type = String)]
    pub vm_id: VmId,
    /// Power state after the operation.
    pub power_state: PowerState,
    /// Snapshot created or targeted, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub snapshot_id: Option<SnapshotId>,
    /// `true` if the VM was already in the requested state.
    pub noop: bool,
}

impl OperationOutcome {
    pub(crate) const fn new(vm_id: VmId, power_state: PowerState) -> Self {
        Self {
            vm_id,
            power_state,
            snapshot_id: None,
            noop: false,
        }
    }

    pub(crate) const fn noop(vm_id: VmId, power_state: PowerState) -> Self {
        Self {
            vm_id,
            power_state,
            snapshot_id: None,
            noop: true,
        }
    }

    pub(crate) fn with_snapshot(mut self, snapshot_id: SnapshotId) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }
}

/// Progress of a submitted operation.
#[derive(Debug, Clone)]
pub enum OperationStatus {
    /// Still executing.
    Running,
    /// Finished successfully.
    Succeeded(OperationOutcome),
    /// Finished with an error.
    Failed(OrchestratorError),
    /// Stopped by [`OperationHandle::cancel`].
    Cancelled,
}

impl OperationStatus {
    /// Returns `true` once the operation has finished.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns the status as a static string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub(crate) fn from_result(result: Result<OperationOutcome, OrchestratorError>) -> Self {
        match result {
            Ok(outcome) => Self::Succeeded(outcome),
            Err(OrchestratorError::Cancelled { .. }) => Self::Cancelled,
            Err(err) => Self::Failed(err),
        }
    }
}

/// Handle on a submitted operation: poll, await, or cancel it.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: OperationId,
    name: &'static str,
    target: Option<VmId>,
    submitted_at: DateTime<Utc>,
    status: watch::Receiver<OperationStatus>,
    cancel: CancellationToken,
}

impl OperationHandle {
    pub(crate) fn new(
        operation: &Operation,
        status: watch::Receiver<OperationStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: OperationId::new(),
            name: operation.name(),
            target: operation.target().cloned(),
            submitted_at: Utc::now(),
            status,
            cancel,
        }
    }

    /// Operation identifier.
    #[must_use]
    pub const fn id(&self) -> OperationId {
        self.id
    }

    /// Operation name (e.g. `"power_on"`).
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Targeted VM, if any.
    #[must_use]
    pub const fn target(&self) -> Option<&VmId> {
        self.target.as_ref()
    }

    /// Submission time.
    #[must_use]
    pub const fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Returns the current status without waiting.
    #[must_use]
    pub fn poll(&self) -> OperationStatus {
        self.status.borrow().clone()
    }

    /// Waits for the operation to finish and returns its final status.
    pub async fn wait(&self) -> OperationStatus {
        let mut status = self.status.clone();
        if let Ok(finished) = status.wait_for(OperationStatus::is_finished).await {
            return finished.clone();
        }
        // Executor gone without reporting; keep the last value seen.
        status.borrow().clone()
    }

    /// Requests cancellation. Returns `false` if the operation already
    /// finished.
    pub fn cancel(&self) -> bool {
        if self.poll().is_finished() {
            return false;
        }
        tracing::info!(operation_id = %self.id, operation = self.name, "cancellation requested");
        self.cancel.cancel();
        true
    }
}
