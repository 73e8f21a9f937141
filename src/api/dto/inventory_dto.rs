//! Inventory report DTOs with derived size figures.

use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{DatastoreUsage, HostHealth};

/// One row of the host health report.
#[derive(Debug, Serialize, ToSchema)]
pub struct HostReport {
    /// Raw host health.
    #[serde(flatten)]
    pub host: HostHealth,
    /// Installed memory in GiB.
    pub memory_gib: f64,
}

impl From<HostHealth> for HostReport {
    fn from(host: HostHealth) -> Self {
        Self {
            memory_gib: host.memory_gib(),
            host,
        }
    }
}

/// One row of the datastore usage report.
#[derive(Debug, Serialize, ToSchema)]
pub struct DatastoreReport {
    /// Raw capacity figures.
    #[serde(flatten)]
    pub datastore: DatastoreUsage,
    /// Used space in bytes.
    pub used_bytes: u64,
    /// Capacity in GiB.
    pub capacity_gib: f64,
    /// Free space in GiB.
    pub free_gib: f64,
    /// Used space in GiB.
    pub used_gib: f64,
}

impl From<DatastoreUsage> for DatastoreReport {
    fn from(datastore: DatastoreUsage) -> Self {
        Self {
            used_bytes: datastore.used_bytes(),
            capacity_gib: datastore.capacity_gib(),
            free_gib: datastore.free_gib(),
            used_gib: datastore.used_gib(),
            datastore,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn datastore_report_flattens_raw_fields() {
        let report = DatastoreReport::from(DatastoreUsage {
            name: "LocalDS_0".to_string(),
            capacity_bytes: 2 * 1024 * 1024 * 1024,
            free_bytes: 1024 * 1024 * 1024,
        });
        let Ok(json) = serde_json::to_value(&report) else {
            panic!("serialization failed");
        };
        assert_eq!(json["name"], "LocalDS_0");
        assert_eq!(json["used_bytes"], 1024 * 1024 * 1024);
        assert_eq!(json["used_gib"], 1.0);
    }
}
