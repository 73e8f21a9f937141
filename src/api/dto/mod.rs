//! Data Transfer Objects for REST request/response serialization.
//!
//! Domain types that already carry `Serialize` and `ToSchema` (records,
//! snapshot nodes, inventory) are returned as-is; the DTOs here cover
//! request bodies and operation bookkeeping.

pub mod common_dto;
pub mod event_dto;
pub mod inventory_dto;
pub mod operation_dto;
pub mod snapshot_dto;
pub mod vm_dto;

pub use common_dto::*;
pub use event_dto::*;
pub use inventory_dto::*;
pub use operation_dto::*;
pub use snapshot_dto::*;
pub use vm_dto::*;
