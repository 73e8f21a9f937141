//! Read-through host and datastore inventory types.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Health summary of one hypervisor host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HostHealth {
    /// Host name.
    pub name: String,
    /// Hardware vendor.
    pub vendor: String,
    /// Hardware model.
    pub model: String,
    /// CPU model string.
    pub cpu_model: String,
    /// Physical CPU packages.
    pub cpu_packages: u32,
    /// Physical CPU cores.
    pub cpu_cores: u32,
    /// Installed memory in bytes.
    pub memory_bytes: u64,
    /// Management connection state (e.g. `connected`).
    pub connection_state: String,
    /// Host power state (e.g. `poweredOn`).
    pub power_state: String,
    /// Overall health (`green`, `yellow`, `red`, `gray`).
    pub overall_status: String,
}

impl HostHealth {
    /// Installed memory in GiB.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn memory_gib(&self) -> f64 {
        self.memory_bytes as f64 / GIB
    }
}

/// Capacity summary of one datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DatastoreUsage {
    /// Datastore name.
    pub name: String,
    /// Total capacity in bytes.
    pub capacity_bytes: u64,
    /// Free space in bytes.
    pub free_bytes: u64,
}

impl DatastoreUsage {
    /// Used space in bytes.
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.free_bytes)
    }

    /// Capacity in GiB.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn capacity_gib(&self) -> f64 {
        self.capacity_bytes as f64 / GIB
    }

    /// Free space in GiB.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn free_gib(&self) -> f64 {
        self.free_bytes as f64 / GIB
    }

    /// Used space in GiB.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn used_gib(&self) -> f64 {
        self.used_bytes() as f64 / GIB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_space_is_capacity_minus_free() {
        let ds = DatastoreUsage {
            name: "LocalDS_0".to_string(),
            capacity_bytes: 4 * 1024 * 1024 * 1024,
            free_bytes: 1024 * 1024 * 1024,
        };
        assert_eq!(ds.used_bytes(), 3 * 1024 * 1024 * 1024);
        assert!((ds.used_gib() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn over_reported_free_space_saturates() {
        let ds = DatastoreUsage {
            name: "odd".to_string(),
            capacity_bytes: 10,
            free_bytes: 20,
        };
        assert_eq!(ds.used_bytes(), 0);
    }
}
