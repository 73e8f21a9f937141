//! Background maintenance: tombstone purging and periodic reconciliation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::event_monitor::EventMonitor;
use super::vm_locks::VmLocks;
use crate::domain::VmStateStore;

/// Shortest purge cadence.
const MIN_PURGE_PERIOD: Duration = Duration::from_secs(1);

/// Spawns a task that drops expired tombstones (and their exclusion tokens)
/// every half grace period until `shutdown` fires.
pub fn spawn_tombstone_purger(
    store: Arc<VmStateStore>,
    locks: Arc<VmLocks>,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = (grace / 2).max(MIN_PURGE_PERIOD);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let purged = store.purge_expired(Instant::now()).await;
                    for vm_id in &purged {
                        locks.forget(vm_id).await;
                    }
                    if !purged.is_empty() {
                        tracing::info!(count = purged.len(), "purged expired tombstones");
                    }
                }
            }
        }
        tracing::debug!("tombstone purger stopped");
    })
}

/// Spawns a task that reconciles against the control plane every `period`
/// until `shutdown` fires. The first pass runs one period after start.
pub fn spawn_reconciler(
    monitor: Arc<EventMonitor>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = monitor.reconcile().await {
                        tracing::warn!(error = %err, "periodic reconciliation failed");
                    }
                }
            }
        }
        tracing::debug!("periodic reconciler stopped");
    })
}
