//! In-process checkpoint store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{CheckpointStore, StoredCheckpoint};
use crate::domain::{Sequence, VmId};
use crate::error::OrchestratorError;

/// Checkpoints held in memory; lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<VmId, StoredCheckpoint>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn record(&self, vm_id: &VmId, sequence: Sequence) -> Result<(), OrchestratorError> {
        let mut checkpoints = self.checkpoints.write().await;
        let entry = checkpoints
            .entry(vm_id.clone())
            .or_insert_with(|| StoredCheckpoint {
                vm_id: vm_id.clone(),
                last_sequence: sequence,
                updated_at: Utc::now(),
            });
        if sequence > entry.last_sequence {
            entry.last_sequence = sequence;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredCheckpoint>, OrchestratorError> {
        let mut rows: Vec<StoredCheckpoint> =
            self.checkpoints.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resume_cursor_is_highest_sequence() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.resume_cursor().await.ok(), Some(None));

        let _ = store.record(&VmId::from("vm-1"), 4).await;
        let _ = store.record(&VmId::from("vm-2"), 9).await;
        let _ = store.record(&VmId::from("vm-1"), 7).await;
        assert_eq!(store.resume_cursor().await.ok(), Some(Some(9)));
    }

    #[tokio::test]
    async fn checkpoints_never_move_backwards() {
        let store = MemoryCheckpointStore::new();
        let vm = VmId::from("vm-1");
        let _ = store.record(&vm, 10).await;
        let _ = store.record(&vm, 3).await;
        let rows = store.load_all().await.unwrap_or_default();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().map(|r| r.last_sequence), Some(10));
    }
}
