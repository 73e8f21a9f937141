//! Authoritative in-memory cache of VM records.
//!
//! [`VmStateStore`] is the single shared mutable structure of the engine.
//! Reconciliation, the event monitor and the orchestrator all write through
//! it; writes are ordered by control-plane revision, never by arrival time.
//!
//! # Write paths
//!
//! - [`VmStateStore::upsert`] replaces a record when the incoming revision is
//!   at least the stored one (stale writes are ignored).
//! - [`VmStateStore::apply_confirmed`] moves a VM to a control-plane-confirmed
//!   state at a revision; any edge is allowed except out of `Deleted`.
//! - [`VmStateStore::transition`] is the orchestrator's local move along the
//!   lifecycle edge table (e.g. `Off -> PoweringOn` before dispatch).
//!
//! `Deleted` is terminal. The record stays as a tombstone until
//! [`VmStateStore::purge_expired`] runs past its grace deadline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use utoipa::IntoParams;

use super::{EventBus, PowerState, Revision, VmChange, VmId, VmRecord};
use crate::error::OrchestratorError;

/// Result of a revision-guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The write replaced (or created) the record.
    Applied,
    /// The write carried exactly the stored contents.
    Unchanged,
    /// The write's revision is older than the stored one; ignored.
    StaleRevision,
    /// The stored record is a `Deleted` tombstone; ignored.
    Terminal,
}

impl UpsertOutcome {
    /// Returns `true` if the store now reflects the write.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied | Self::Unchanged)
    }
}

/// Query filter for [`VmStateStore::list`].
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct VmFilter {
    /// Only VMs in this power state.
    #[serde(default)]
    pub power_state: Option<PowerState>,
    /// Only VMs placed on this host.
    #[serde(default)]
    pub host: Option<String>,
    /// Only VMs whose name contains this substring.
    #[serde(default)]
    pub name_contains: Option<String>,
    /// Only templates (`true`) or only regular VMs (`false`).
    #[serde(default)]
    pub is_template: Option<bool>,
    /// Include `Deleted` tombstones.
    #[serde(default)]
    pub include_deleted: bool,
}

impl VmFilter {
    /// Returns `true` if `record` passes the filter.
    #[must_use]
    pub fn matches(&self, record: &VmRecord) -> bool {
        if !self.include_deleted
            && record.power_state.is_terminal()
            && self.power_state != Some(PowerState::Deleted)
        {
            return false;
        }
        if let Some(state) = self.power_state
            && record.power_state != state
        {
            return false;
        }
        if let Some(host) = &self.host
            && record.host.as_deref() != Some(host.as_str())
        {
            return false;
        }
        if let Some(needle) = &self.name_contains
            && !record.name.contains(needle.as_str())
        {
            return false;
        }
        if let Some(template) = self.is_template
            && record.is_template != template
        {
            return false;
        }
        true
    }
}

#[derive(Debug)]
struct StoredVm {
    record: VmRecord,
    tombstone_until: Option<Instant>,
}

/// Concurrent VM record cache with change notifications.
#[derive(Debug)]
pub struct VmStateStore {
    vms: RwLock<HashMap<VmId, StoredVm>>,
    event_bus: EventBus,
    tombstone_grace: Duration,
}

impl VmStateStore {
    /// Creates an empty store publishing to `event_bus`.
    #[must_use]
    pub fn new(event_bus: EventBus, tombstone_grace: Duration) -> Self {
        Self {
            vms: RwLock::new(HashMap::new()),
            event_bus,
            tombstone_grace,
        }
    }

    /// Returns the bus change notifications are published on.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Inserts or replaces a record if its revision is not older than the
    /// stored one. A record arriving in `Deleted` starts the tombstone timer.
    pub async fn upsert(&self, record: VmRecord) -> UpsertOutcome {
        let mut map = self.vms.write().await;
        let tombstone = record
            .power_state
            .is_terminal()
            .then(|| Instant::now() + self.tombstone_grace);

        if let Some(stored) = map.get_mut(&record.id) {
            if stored.record.power_state.is_terminal() {
                return UpsertOutcome::Terminal;
            }
            if record.revision < stored.record.revision {
                tracing::debug!(
                    vm_id = %record.id,
                    stored = stored.record.revision,
                    incoming = record.revision,
                    "ignoring stale upsert"
                );
                return UpsertOutcome::StaleRevision;
            }
            if stored.record == record {
                return UpsertOutcome::Unchanged;
            }
            stored.record = record.clone();
            stored.tombstone_until = tombstone;
        } else {
            map.insert(
                record.id.clone(),
                StoredVm {
                    record: record.clone(),
                    tombstone_until: tombstone,
                },
            );
        }

        if record.power_state.is_terminal() {
            tracing::info!(vm_id = %record.id, "vm deleted, tombstoned");
            self.publish_deleted(&record);
        } else {
            let _ = self.event_bus.publish(VmChange::Upserted {
                record,
                timestamp: Utc::now(),
            });
        }
        UpsertOutcome::Applied
    }

    /// Returns a copy of the record.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::VmNotFound`] if the VM is unknown.
    pub async fn get(&self, id: &VmId) -> Result<VmRecord, OrchestratorError> {
        let map = self.vms.read().await;
        map.get(id)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| OrchestratorError::VmNotFound(id.clone()))
    }

    /// Returns all records passing `filter`, ordered by id.
    pub async fn list(&self, filter: &VmFilter) -> Vec<VmRecord> {
        let map = self.vms.read().await;
        let mut records: Vec<VmRecord> = map
            .values()
            .filter(|stored| filter.matches(&stored.record))
            .map(|stored| stored.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Returns `true` if a non-deleted VM named `name` exists.
    pub async fn contains_name(&self, name: &str) -> bool {
        let map = self.vms.read().await;
        map.values()
            .any(|s| s.record.name == name && !s.record.power_state.is_terminal())
    }

    /// Moves a VM to `Deleted` at its current revision and starts the
    /// tombstone timer. Idempotent for VMs already deleted.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::VmNotFound`] if the VM is unknown.
    pub async fn mark_deleted(&self, id: &VmId) -> Result<VmRecord, OrchestratorError> {
        let mut map = self.vms.write().await;
        let stored = map
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::VmNotFound(id.clone()))?;
        if stored.record.power_state.is_terminal() {
            return Ok(stored.record.clone());
        }
        stored.record.power_state = PowerState::Deleted;
        stored.tombstone_until = Some(Instant::now() + self.tombstone_grace);
        let record = stored.record.clone();
        tracing::info!(vm_id = %id, "vm deleted, tombstoned");
        self.publish_deleted(&record);
        Ok(record)
    }

    /// Applies a control-plane-confirmed state at `revision`.
    ///
    /// Any edge is accepted (confirmed facts override local in-flight state)
    /// except out of `Deleted`. Older revisions are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::VmNotFound`] if the VM is unknown.
    pub async fn apply_confirmed(
        &self,
        id: &VmId,
        state: PowerState,
        revision: Revision,
    ) -> Result<UpsertOutcome, OrchestratorError> {
        let mut map = self.vms.write().await;
        let stored = map
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::VmNotFound(id.clone()))?;
        if stored.record.power_state.is_terminal() {
            return Ok(UpsertOutcome::Terminal);
        }
        if revision < stored.record.revision {
            return Ok(UpsertOutcome::StaleRevision);
        }
        let from = stored.record.power_state;
        if from == state && stored.record.revision == revision {
            return Ok(UpsertOutcome::Unchanged);
        }
        stored.record.power_state = state;
        stored.record.revision = revision;
        if state.is_terminal() {
            stored.tombstone_until = Some(Instant::now() + self.tombstone_grace);
            let record = stored.record.clone();
            self.publish_deleted(&record);
        } else {
            let _ = self.event_bus.publish(VmChange::StateChanged {
                vm_id: id.clone(),
                from,
                to: state,
                revision,
                timestamp: Utc::now(),
            });
        }
        Ok(UpsertOutcome::Applied)
    }

    /// Moves a VM along a lifecycle edge without changing its revision.
    ///
    /// Returns the record as it was before the move.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::VmNotFound`] if the VM is unknown.
    /// - [`OrchestratorError::InvalidState`] if `current -> to` is not an edge.
    pub async fn transition(
        &self,
        id: &VmId,
        to: PowerState,
        operation: &'static str,
    ) -> Result<VmRecord, OrchestratorError> {
        let mut map = self.vms.write().await;
        let stored = map
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::VmNotFound(id.clone()))?;
        let before = stored.record.clone();
        if !before.power_state.can_transition_to(to) {
            return Err(OrchestratorError::InvalidState {
                vm_id: id.clone(),
                operation,
                state: before.power_state,
            });
        }
        stored.record.power_state = to;
        tracing::debug!(vm_id = %id, from = %before.power_state, %to, "local transition");
        let _ = self.event_bus.publish(VmChange::StateChanged {
            vm_id: id.clone(),
            from: before.power_state,
            to,
            revision: before.revision,
            timestamp: Utc::now(),
        });
        Ok(before)
    }

    /// Marks a VM `Stale` pending the next reconciliation.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::VmNotFound`] if the VM is unknown.
    /// - [`OrchestratorError::InvalidState`] if the VM is already deleted.
    pub async fn mark_stale(&self, id: &VmId) -> Result<VmRecord, OrchestratorError> {
        tracing::warn!(vm_id = %id, "vm state unknown, marking stale");
        self.transition(id, PowerState::Stale, "mark_stale").await
    }

    /// Removes tombstones whose grace period ended at or before `now`.
    ///
    /// Returns the purged ids.
    pub async fn purge_expired(&self, now: Instant) -> Vec<VmId> {
        let mut map = self.vms.write().await;
        let expired: Vec<VmId> = map
            .iter()
            .filter(|(_, s)| s.tombstone_until.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            map.remove(id);
            tracing::debug!(vm_id = %id, "tombstone purged");
            let _ = self.event_bus.publish(VmChange::Purged {
                vm_id: id.clone(),
                timestamp: Utc::now(),
            });
        }
        expired
    }

    /// Returns the number of records, tombstones included.
    pub async fn len(&self) -> usize {
        self.vms.read().await.len()
    }

    /// Returns `true` if the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.vms.read().await.is_empty()
    }

    fn publish_deleted(&self, record: &VmRecord) {
        let _ = self.event_bus.publish(VmChange::Deleted {
            vm_id: record.id.clone(),
            revision: record.revision,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::Resources;

    fn record(id: &str, state: PowerState, revision: Revision) -> VmRecord {
        VmRecord {
            id: VmId::from(id),
            name: format!("name-{id}"),
            power_state: state,
            host: Some("host-0".to_string()),
            datastores: vec!["ds-0".to_string()],
            resources: Resources {
                vcpus: 1,
                memory_mib: 128,
            },
            is_template: false,
            revision,
        }
    }

    fn store() -> VmStateStore {
        VmStateStore::new(EventBus::new(64), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn upsert_rejects_older_revision() {
        let store = store();
        assert_eq!(store.upsert(record("vm-1", PowerState::On, 5)).await, UpsertOutcome::Applied);
        assert_eq!(
            store.upsert(record("vm-1", PowerState::Off, 4)).await,
            UpsertOutcome::StaleRevision
        );
        let Ok(current) = store.get(&VmId::from("vm-1")).await else {
            panic!("record missing");
        };
        assert_eq!(current.power_state, PowerState::On);
    }

    #[tokio::test]
    async fn upsert_equal_revision_replaces() {
        let store = store();
        store.upsert(record("vm-1", PowerState::On, 5)).await;
        assert_eq!(store.upsert(record("vm-1", PowerState::Off, 5)).await, UpsertOutcome::Applied);
        assert_eq!(store.upsert(record("vm-1", PowerState::Off, 5)).await, UpsertOutcome::Unchanged);
    }

    #[tokio::test]
    async fn deleted_is_terminal() {
        let store = store();
        store.upsert(record("vm-1", PowerState::Off, 1)).await;
        assert!(store.mark_deleted(&VmId::from("vm-1")).await.is_ok());

        assert_eq!(store.upsert(record("vm-1", PowerState::On, 99)).await, UpsertOutcome::Terminal);
        let outcome = store
            .apply_confirmed(&VmId::from("vm-1"), PowerState::On, 100)
            .await;
        assert!(matches!(outcome, Ok(UpsertOutcome::Terminal)));
        let err = store
            .transition(&VmId::from("vm-1"), PowerState::PoweringOn, "power_on")
            .await;
        assert!(matches!(err, Err(OrchestratorError::InvalidState { .. })));
        assert!(store.mark_stale(&VmId::from("vm-1")).await.is_err());
    }

    #[tokio::test]
    async fn transition_enforces_edges() {
        let store = store();
        store.upsert(record("vm-1", PowerState::Off, 1)).await;
        let err = store
            .transition(&VmId::from("vm-1"), PowerState::Suspended, "suspend")
            .await;
        let Err(OrchestratorError::InvalidState { state, operation, .. }) = err else {
            panic!("expected invalid state");
        };
        assert_eq!(state, PowerState::Off);
        assert_eq!(operation, "suspend");

        let Ok(before) = store
            .transition(&VmId::from("vm-1"), PowerState::PoweringOn, "power_on")
            .await
        else {
            panic!("edge should be allowed");
        };
        assert_eq!(before.power_state, PowerState::Off);
    }

    #[tokio::test]
    async fn apply_confirmed_overrides_in_flight_state() {
        let store = store();
        store.upsert(record("vm-1", PowerState::Off, 1)).await;
        let _ = store
            .transition(&VmId::from("vm-1"), PowerState::PoweringOn, "power_on")
            .await;
        let outcome = store
            .apply_confirmed(&VmId::from("vm-1"), PowerState::Off, 2)
            .await;
        assert!(matches!(outcome, Ok(UpsertOutcome::Applied)));
        let Ok(current) = store.get(&VmId::from("vm-1")).await else {
            panic!("record missing");
        };
        assert_eq!(current.power_state, PowerState::Off);
        assert_eq!(current.revision, 2);
    }

    #[tokio::test]
    async fn list_filters_and_hides_tombstones() {
        let store = store();
        store.upsert(record("vm-1", PowerState::On, 1)).await;
        store.upsert(record("vm-2", PowerState::Off, 1)).await;
        store.upsert(record("vm-3", PowerState::Off, 1)).await;
        let _ = store.mark_deleted(&VmId::from("vm-3")).await;

        assert_eq!(store.list(&VmFilter::default()).await.len(), 2);
        let off = VmFilter {
            power_state: Some(PowerState::Off),
            ..VmFilter::default()
        };
        assert_eq!(store.list(&off).await.len(), 1);
        let all = VmFilter {
            include_deleted: true,
            ..VmFilter::default()
        };
        assert_eq!(store.list(&all).await.len(), 3);
        assert!(!store.contains_name("name-vm-3").await);
        assert!(store.contains_name("name-vm-2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn tombstones_purge_after_grace() {
        let store = store();
        store.upsert(record("vm-1", PowerState::Off, 1)).await;
        let _ = store.mark_deleted(&VmId::from("vm-1")).await;

        assert!(store.purge_expired(Instant::now()).await.is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        let purged = store.purge_expired(Instant::now()).await;
        assert_eq!(purged, vec![VmId::from("vm-1")]);
        assert!(store.get(&VmId::from("vm-1")).await.is_err());
    }

    #[tokio::test]
    async fn mutations_publish_notifications() {
        let store = store();
        let mut rx = store.event_bus().subscribe();
        store.upsert(record("vm-1", PowerState::Off, 1)).await;
        let _ = store.mark_deleted(&VmId::from("vm-1")).await;

        let Ok(first) = rx.recv().await else {
            panic!("expected upsert notification");
        };
        assert_eq!(first.change_type_str(), "upserted");
        let Ok(second) = rx.recv().await else {
            panic!("expected delete notification");
        };
        assert_eq!(second.change_type_str(), "deleted");
    }
}
