//! PostgreSQL implementation of the checkpoint store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{CheckpointStore, StoredCheckpoint};
use crate::domain::{Sequence, VmId};
use crate::error::OrchestratorError;

/// PostgreSQL-backed checkpoint store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns a [`OrchestratorError::Persistence`] if the database is
    /// unreachable or a migration fails.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, OrchestratorError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(persistence)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        tracing::info!("checkpoint database ready");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn record(&self, vm_id: &VmId, sequence: Sequence) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO event_checkpoints (vm_id, last_sequence, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (vm_id) DO UPDATE \
             SET last_sequence = GREATEST(event_checkpoints.last_sequence, EXCLUDED.last_sequence), \
                 updated_at = now()",
        )
        .bind(vm_id.as_str())
        .bind(to_db(sequence))
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredCheckpoint>, OrchestratorError> {
        let rows = sqlx::query_as::<_, (String, i64, DateTime<Utc>)>(
            "SELECT vm_id, last_sequence, updated_at FROM event_checkpoints ORDER BY vm_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(rows
            .into_iter()
            .map(|(vm_id, last_sequence, updated_at)| StoredCheckpoint {
                vm_id: VmId::new(vm_id),
                last_sequence: Sequence::try_from(last_sequence).unwrap_or(0),
                updated_at,
            })
            .collect())
    }

    async fn resume_cursor(&self) -> Result<Option<Sequence>, OrchestratorError> {
        let max = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(last_sequence) FROM event_checkpoints",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(max.map(|seq| Sequence::try_from(seq).unwrap_or(0)))
    }
}

fn to_db(sequence: Sequence) -> i64 {
    i64::try_from(sequence).unwrap_or(i64::MAX)
}

#[allow(clippy::needless_pass_by_value)]
fn persistence(err: sqlx::Error) -> OrchestratorError {
    OrchestratorError::Persistence(err.to_string())
}
