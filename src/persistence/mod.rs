//! Persistence layer: event-feed checkpoints.
//!
//! The event monitor records, per VM, the last control-plane sequence number
//! it applied. On restart it resumes the feed from the highest recorded
//! sequence instead of running a full reconciliation. [`CheckpointStore`] is
//! the seam; [`MemoryCheckpointStore`] keeps checkpoints in process and
//! [`postgres::PostgresCheckpointStore`] keeps them in PostgreSQL via `sqlx`.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;

use crate::domain::{Sequence, VmId};
use crate::error::OrchestratorError;

pub use memory::MemoryCheckpointStore;
pub use models::StoredCheckpoint;
pub use postgres::PostgresCheckpointStore;

/// Durable record of event-feed progress.
#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Records that `sequence` was the last event applied for `vm_id`.
    /// Never moves a checkpoint backwards.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on storage failure.
    async fn record(&self, vm_id: &VmId, sequence: Sequence) -> Result<(), OrchestratorError>;

    /// Returns every stored checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on storage failure.
    async fn load_all(&self) -> Result<Vec<StoredCheckpoint>, OrchestratorError>;

    /// Sequence to resume the feed after: the highest recorded one, or
    /// `None` if nothing was ever recorded.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on storage failure.
    async fn resume_cursor(&self) -> Result<Option<Sequence>, OrchestratorError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .map(|checkpoint| checkpoint.last_sequence)
            .max())
    }
}
