//! Database models for event checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Sequence, VmId};

/// A row of the `event_checkpoints` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    /// VM the checkpoint belongs to.
    pub vm_id: VmId,
    /// Last applied feed sequence number for this VM.
    pub last_sequence: Sequence,
    /// When the checkpoint was last advanced.
    pub updated_at: DateTime<Utc>,
}
