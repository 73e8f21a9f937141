//! VM record and the power-state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::VmId;

/// Monotonic control-plane revision counter.
pub type Revision = u64;

/// Lifecycle / power state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Powered off.
    Off,
    /// Power-on dispatched, awaiting acknowledgment.
    PoweringOn,
    /// Running.
    On,
    /// Power-off dispatched, awaiting acknowledgment.
    PoweringOff,
    /// Suspended to memory.
    Suspended,
    /// Deletion dispatched, awaiting acknowledgment.
    Deleting,
    /// Deleted; terminal tombstone.
    Deleted,
    /// Unknown after exhausted retries; resolved by the next reconciliation.
    Stale,
}

impl PowerState {
    /// Returns `true` for the terminal `Deleted` state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Returns `true` for the sub-states that wait on a control-plane ack.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::PoweringOn | Self::PoweringOff | Self::Deleting)
    }

    /// Returns `true` when a locally driven transition `self -> next` is a
    /// defined edge of the lifecycle state machine.
    ///
    /// In-flight states may fall back to the state they left when the control
    /// plane rejects the request. Every non-terminal state may become `Stale`.
    /// Confirmed control-plane facts (events, reconciliation) bypass this
    /// table; only `Deleted` stays closed to them.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use PowerState::{Deleted, Deleting, Off, On, PoweringOff, PoweringOn, Stale, Suspended};

        if matches!(self, Deleted) {
            return false;
        }
        if matches!(next, Stale) {
            return true;
        }
        match self {
            Off => matches!(next, PoweringOn | Deleting),
            On => matches!(next, PoweringOff | Suspended | Deleting),
            Suspended => matches!(next, PoweringOn | PoweringOff | Deleting),
            PoweringOn => matches!(next, On | Off | Suspended),
            PoweringOff => matches!(next, Off | On | Suspended),
            Deleting => matches!(next, Deleted | Off | On | Suspended),
            Stale | Deleted => false,
        }
    }

    /// Snake-case name used in logs and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::PoweringOn => "powering_on",
            Self::On => "on",
            Self::PoweringOff => "powering_off",
            Self::Suspended => "suspended",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory allocation of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Resources {
    /// Virtual CPU count.
    pub vcpus: u32,
    /// Memory size in MiB.
    pub memory_mib: u64,
}

/// Cached view of one VM, as last confirmed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VmRecord {
    /// Control-plane identifier.
    pub id: VmId,
    /// Display name (unique among live VMs).
    pub name: String,
    /// Current lifecycle state.
    pub power_state: PowerState,
    /// Host the VM is placed on.
    pub host: Option<String>,
    /// Datastores backing the VM's disks.
    pub datastores: Vec<String>,
    /// CPU / memory allocation.
    pub resources: Resources,
    /// Whether the VM has been converted to a template.
    #[serde(default)]
    pub is_template: bool,
    /// Last observed control-plane revision.
    pub revision: Revision,
}

impl VmRecord {
    /// Returns a copy of the record moved to `state` at `revision`.
    #[must_use]
    pub fn with_state(&self, state: PowerState, revision: Revision) -> Self {
        Self {
            power_state: state,
            revision,
            ..self.clone()
        }
    }
}
