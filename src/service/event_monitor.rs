//! Event monitor: applies the control-plane event feed and reconciles drift.
//!
//! Events are confirmed facts. The monitor admits them strictly in feed
//! sequence order: anything at or below the cursor is dropped as a
//! duplicate, anything ahead of `cursor + 1` waits in a bounded reorder
//! window until the gap closes. Admitted events are handed to a per-VM lane
//! that applies them in order while holding the VM's exclusion token, so an
//! event never interleaves with an in-flight operation on the same VM and a
//! busy VM never holds up events for the others.
//!
//! The persisted checkpoint only advances past a sequence once every event
//! up to it has been applied, whatever lane it went to.
//!
//! Reconciliation (a bulk listing of the control plane) runs before
//! consuming a freshly reopened stream, when the reorder window overflows,
//! and periodically from the maintenance task.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::retry::{RetryError, RetryPolicy};
use super::vm_locks::VmLocks;
use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::domain::{
    EventCategory, EventKind, PowerState, Sequence, SnapshotListing, SnapshotRegistry,
    SnapshotTree, UpsertOutcome, VmEvent, VmFilter, VmId, VmStateStore,
};
use crate::error::OrchestratorError;
use crate::persistence::CheckpointStore;

/// Applied events kept for [`EventMonitor::recent_events`].
const RECENT_EVENTS: usize = 256;

/// What [`EventMonitor::ingest`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event changed the store or a snapshot tree.
    Applied,
    /// Sequence at or below the cursor; dropped.
    Duplicate,
    /// Ahead of the cursor; held until the gap closes.
    Buffered,
    /// Consumed without effect (stale revision, unknown VM, tombstone, or
    /// covered by a reconciliation).
    Ignored,
}

/// Tuning knobs of the monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Backoff for control-plane reads and stream reconnects.
    pub retry: RetryPolicy,
    /// Per-call acknowledgment timeout.
    pub call_timeout: Duration,
    /// Maximum number of ahead-of-sequence events held.
    pub reorder_window: usize,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// VMs listed by the control plane.
    pub listed: usize,
    /// Records inserted or replaced.
    pub updated: usize,
    /// Records whose cached power state disagreed with the control plane.
    pub drifted: usize,
    /// Cached VMs confirmed gone from the control plane, now tombstoned.
    pub removed: usize,
    /// Snapshot trees rebuilt from the control plane listing.
    pub trees_rebuilt: usize,
}

#[derive(Debug, Default)]
struct FeedCursor {
    last: Sequence,
    pending: BTreeMap<Sequence, VmEvent>,
}

/// Admitted sequences that have not been applied yet.
#[derive(Debug, Default)]
struct Progress {
    admitted: Sequence,
    inflight: BTreeSet<Sequence>,
    durable: Sequence,
}

impl Progress {
    /// Highest sequence below which nothing is still in flight.
    fn watermark(&self) -> Sequence {
        self.inflight
            .first()
            .map_or(self.admitted, |first| first.saturating_sub(1))
    }
}

#[derive(Debug)]
struct LaneItem {
    event: VmEvent,
    reply: Option<oneshot::Sender<bool>>,
}

type Lanes = Arc<Mutex<HashMap<VmId, mpsc::UnboundedSender<LaneItem>>>>;

enum Admission {
    Duplicate,
    Buffered,
    Overflow { vm_id: VmId, skip_to: Sequence },
    Dispatched(Vec<oneshot::Receiver<bool>>),
}

/// Shared state the lanes and reconciliation mutate.
#[derive(Debug)]
struct Applier {
    control_plane: Arc<dyn ControlPlane>,
    store: Arc<VmStateStore>,
    snapshots: Arc<SnapshotRegistry>,
    locks: Arc<VmLocks>,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: MonitorSettings,
    progress: Mutex<Progress>,
}

/// Consumer of the control-plane event feed.
#[derive(Debug)]
pub struct EventMonitor {
    core: Arc<Applier>,
    cursor: Mutex<FeedCursor>,
    lanes: Lanes,
    recent: RwLock<VecDeque<VmEvent>>,
}

impl EventMonitor {
    /// Creates a monitor with its cursor at zero.
    #[must_use]
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        store: Arc<VmStateStore>,
        snapshots: Arc<SnapshotRegistry>,
        locks: Arc<VmLocks>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            core: Arc::new(Applier {
                control_plane,
                store,
                snapshots,
                locks,
                checkpoints,
                settings,
                progress: Mutex::new(Progress::default()),
            }),
            cursor: Mutex::new(FeedCursor::default()),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            recent: RwLock::new(VecDeque::with_capacity(RECENT_EVENTS)),
        }
    }

    /// Last admitted sequence number.
    pub async fn cursor(&self) -> Sequence {
        self.cursor.lock().await.last
    }

    /// Number of events waiting in the reorder window.
    pub async fn pending(&self) -> usize {
        self.cursor.lock().await.pending.len()
    }

    /// Up to `limit` of the most recently admitted events, newest first,
    /// optionally restricted to one category.
    pub async fn recent_events(&self, limit: usize, category: Option<EventCategory>) -> Vec<VmEvent> {
        self.recent
            .read()
            .await
            .iter()
            .rev()
            .filter(|event| category.is_none_or(|c| event.kind.category() == c))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Loads the persisted cursor. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] if checkpoints cannot be
    /// read.
    pub async fn resume(&self) -> Result<bool, OrchestratorError> {
        let Some(sequence) = self.core.checkpoints.resume_cursor().await? else {
            return Ok(false);
        };
        let mut cursor = self.cursor.lock().await;
        cursor.last = cursor.last.max(sequence);
        let mut progress = self.core.progress.lock().await;
        progress.admitted = progress.admitted.max(cursor.last);
        progress.durable = progress.durable.max(sequence);
        tracing::info!(sequence = cursor.last, "resuming event feed from checkpoint");
        Ok(true)
    }

    /// Feeds one event through the ordering discipline and waits until it,
    /// and any buffered events it released, have been applied.
    pub async fn ingest(&self, event: VmEvent) -> IngestOutcome {
        match self.admit(event, true).await {
            Admission::Duplicate => IngestOutcome::Duplicate,
            Admission::Buffered => IngestOutcome::Buffered,
            Admission::Overflow { vm_id, skip_to } => {
                self.recover_from_overflow(&vm_id, skip_to).await;
                IngestOutcome::Ignored
            }
            Admission::Dispatched(replies) => {
                let mut first = None;
                for reply in replies {
                    let applied = reply.await.unwrap_or(false);
                    if first.is_none() {
                        first = Some(applied);
                    }
                }
                if first == Some(true) {
                    IngestOutcome::Applied
                } else {
                    IngestOutcome::Ignored
                }
            }
        }
    }

    /// Feeds one event without waiting for it to be applied.
    async fn feed(&self, event: VmEvent) {
        if let Admission::Overflow { vm_id, skip_to } = self.admit(event, false).await {
            self.recover_from_overflow(&vm_id, skip_to).await;
        }
    }

    /// Orders the event against the cursor and dispatches whatever became
    /// contiguous. Holds the cursor only for bookkeeping, never across an
    /// application or a control-plane call.
    async fn admit(&self, event: VmEvent, wait: bool) -> Admission {
        let mut cursor = self.cursor.lock().await;
        let sequence = event.sequence;

        if sequence <= cursor.last || cursor.pending.contains_key(&sequence) {
            tracing::warn!(
                sequence,
                cursor = cursor.last,
                vm_id = %event.vm_id,
                "dropping duplicate or out-of-order event"
            );
            return Admission::Duplicate;
        }

        if sequence > cursor.last + 1 {
            if cursor.pending.len() < self.core.settings.reorder_window {
                tracing::debug!(sequence, cursor = cursor.last, "buffering ahead-of-sequence event");
                cursor.pending.insert(sequence, event);
                return Admission::Buffered;
            }
            let skip_to = cursor
                .pending
                .last_key_value()
                .map_or(sequence, |(last, _)| (*last).max(sequence));
            tracing::warn!(
                cursor = cursor.last,
                skip_to,
                window = self.core.settings.reorder_window,
                "reorder window overflow, reconciling"
            );
            cursor.pending.clear();
            cursor.last = skip_to;
            let mut progress = self.core.progress.lock().await;
            progress.admitted = progress.admitted.max(skip_to);
            return Admission::Overflow {
                vm_id: event.vm_id,
                skip_to,
            };
        }

        let mut batch = vec![event];
        let mut last = sequence;
        while let Some(event) = cursor.pending.remove(&(last + 1)) {
            last = event.sequence;
            batch.push(event);
        }
        cursor.last = last;

        {
            let mut progress = self.core.progress.lock().await;
            for event in &batch {
                progress.inflight.insert(event.sequence);
            }
            progress.admitted = cursor.last;
        }
        {
            let mut recent = self.recent.write().await;
            for event in &batch {
                if recent.len() == RECENT_EVENTS {
                    recent.pop_front();
                }
                recent.push_back(event.clone());
            }
        }

        let mut replies = Vec::new();
        let mut lanes = self.lanes.lock().await;
        for event in batch {
            let reply = if wait {
                let (tx, rx) = oneshot::channel();
                replies.push(rx);
                Some(tx)
            } else {
                None
            };
            let vm_id = event.vm_id.clone();
            let item = LaneItem { event, reply };
            let item = match lanes.get(&vm_id) {
                Some(lane) => match lane.send(item) {
                    Ok(()) => continue,
                    Err(mpsc::error::SendError(item)) => item,
                },
                None => item,
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(item);
            lanes.insert(vm_id.clone(), tx);
            tokio::spawn(drain_lane(
                Arc::clone(&self.core),
                Arc::clone(&self.lanes),
                vm_id,
                rx,
            ));
        }
        Admission::Dispatched(replies)
    }

    async fn recover_from_overflow(&self, vm_id: &VmId, skip_to: Sequence) {
        if let Err(err) = self.core.reconcile().await {
            tracing::warn!(error = %err, skip_to, "reconciliation after overflow failed");
        }
        self.core.settle(vm_id, None).await;
    }

    /// Brings the store and every snapshot tree in line with a full listing
    /// of the control plane.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Internal`] if the control plane cannot be
    /// listed. Per-VM failures are logged and skipped.
    pub async fn reconcile(&self) -> Result<ReconcileReport, OrchestratorError> {
        self.core.reconcile().await
    }

    /// Consumes the feed until `shutdown` fires.
    ///
    /// Without a persisted checkpoint the first pass reconciles before
    /// subscribing; every reconnect reconciles again to close the gap.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let resumed = match self.resume().await {
            Ok(resumed) => resumed,
            Err(err) => {
                tracing::warn!(error = %err, "checkpoint unavailable, starting from scratch");
                false
            }
        };
        let mut needs_reconcile = !resumed;
        let mut reconnect = self.core.settings.retry.backoff();
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if needs_reconcile && let Err(err) = self.reconcile().await {
                tracing::warn!(error = %err, "reconciliation failed");
            } else {
                let since = self.cursor().await;
                let mut events = self.core.control_plane.subscribe_events(since);
                tracing::info!(since, "event stream opened");
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            tracing::info!("event monitor stopping");
                            return;
                        }
                        next = events.next() => match next {
                            Some(Ok(event)) => {
                                failures = 0;
                                reconnect.reset();
                                self.feed(event).await;
                            }
                            Some(Err(err)) => {
                                tracing::warn!(error = %err, "event stream failed");
                                break;
                            }
                            None => {
                                tracing::warn!("event stream ended");
                                break;
                            }
                        }
                    }
                }
                needs_reconcile = true;
            }

            failures = failures.saturating_add(1);
            let delay = reconnect
                .next_backoff()
                .unwrap_or(self.core.settings.retry.max_delay);
            tracing::debug!(attempt = failures, delay_ms = delay.as_millis(), "reconnecting event stream");
            tokio::select! {
                _ = shutdown.changed() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Applies one VM's events in admission order, then retires the lane.
async fn drain_lane(
    core: Arc<Applier>,
    lanes: Lanes,
    vm_id: VmId,
    mut rx: mpsc::UnboundedReceiver<LaneItem>,
) {
    loop {
        let item = match rx.try_recv() {
            Ok(item) => item,
            Err(_) => {
                // Senders enqueue under the same lock, so nothing can slip in
                // between this check and the removal.
                let mut lanes = lanes.lock().await;
                match rx.try_recv() {
                    Ok(item) => item,
                    Err(_) => {
                        lanes.remove(&vm_id);
                        return;
                    }
                }
            }
        };
        let applied = core.apply(&item.event).await;
        core.settle(&item.event.vm_id, Some(item.event.sequence)).await;
        if let Some(reply) = item.reply {
            let _ = reply.send(applied);
        }
    }
}

impl Applier {
    /// Retires `done` and persists the new watermark if it moved.
    async fn settle(&self, vm_id: &VmId, done: Option<Sequence>) {
        let watermark = {
            let mut progress = self.progress.lock().await;
            if let Some(sequence) = done {
                progress.inflight.remove(&sequence);
            }
            let watermark = progress.watermark();
            if watermark <= progress.durable {
                return;
            }
            progress.durable = watermark;
            watermark
        };
        if let Err(err) = self.checkpoints.record(vm_id, watermark).await {
            tracing::warn!(vm_id = %vm_id, sequence = watermark, error = %err, "checkpoint not persisted");
        }
    }

    /// Applies one event as an authoritative mutation under the VM's token.
    async fn apply(&self, event: &VmEvent) -> bool {
        let vm_id = &event.vm_id;
        let _guard = self.locks.acquire_blocking(vm_id).await;
        tracing::debug!(vm_id = %vm_id, sequence = event.sequence, kind = event.kind_str(), "applying event");

        match &event.kind {
            EventKind::PowerChanged { power_state } => {
                match self
                    .store
                    .apply_confirmed(vm_id, *power_state, event.revision)
                    .await
                {
                    Ok(outcome) => outcome == UpsertOutcome::Applied,
                    Err(OrchestratorError::VmNotFound(_)) => self.adopt_unknown(vm_id).await,
                    Err(err) => {
                        tracing::warn!(vm_id = %vm_id, error = %err, "power event not applied");
                        false
                    }
                }
            }
            EventKind::Created { record } => {
                let mut record = record.clone();
                record.revision = record.revision.max(event.revision);
                let outcome = self.store.upsert(record).await;
                if outcome == UpsertOutcome::Applied {
                    let _ = self.snapshots.get_or_create(vm_id).await;
                }
                outcome == UpsertOutcome::Applied
            }
            EventKind::Deleted => {
                match self
                    .store
                    .apply_confirmed(vm_id, PowerState::Deleted, event.revision)
                    .await
                {
                    Ok(UpsertOutcome::Applied) => {
                        self.snapshots.remove(vm_id).await;
                        true
                    }
                    Ok(_) | Err(_) => false,
                }
            }
            EventKind::SnapshotCreated { node } => {
                self.apply_tree(vm_id, |tree| tree.ingest_created(node.clone()))
                    .await
            }
            EventKind::SnapshotRemoved { snapshot_id } => {
                self.apply_tree(vm_id, |tree| tree.ingest_removed(snapshot_id))
                    .await
            }
            EventKind::SnapshotReverted { snapshot_id } => {
                self.apply_tree(vm_id, |tree| tree.ingest_reverted(snapshot_id))
                    .await
            }
        }
    }

    async fn apply_tree<F>(&self, vm_id: &VmId, mutate: F) -> bool
    where
        F: FnOnce(&mut SnapshotTree) -> Result<bool, OrchestratorError>,
    {
        match self.store.get(vm_id).await {
            Ok(record) if !record.power_state.is_terminal() => {}
            _ => return false,
        }
        let handle = self.snapshots.get_or_create(vm_id).await;
        let mut tree = handle.write().await;
        let was_quarantined = tree.is_quarantined();
        match mutate(&mut tree) {
            Ok(true) => {
                self.snapshots.publish(&tree);
                true
            }
            Ok(false) => false,
            Err(err) => {
                if !was_quarantined {
                    self.snapshots.publish(&tree);
                }
                tracing::error!(vm_id = %vm_id, error = %err, "snapshot event not applied");
                false
            }
        }
    }

    /// Caches a VM that an event mentions before its creation was seen.
    async fn adopt_unknown(&self, vm_id: &VmId) -> bool {
        match self
            .read(|| self.control_plane.get_vm(vm_id))
            .await
        {
            Ok(record) => {
                tracing::info!(vm_id = %vm_id, "adopting vm first seen through an event");
                self.store.upsert(record).await == UpsertOutcome::Applied
            }
            Err(err) => {
                tracing::debug!(vm_id = %vm_id, error = ?err, "event for unknown vm ignored");
                false
            }
        }
    }

    async fn read<T, F, Fut>(&self, call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ControlPlaneError>>,
    {
        self.settings
            .retry
            .run(self.settings.call_timeout, &CancellationToken::new(), call)
            .await
    }

    async fn reconcile(&self) -> Result<ReconcileReport, OrchestratorError> {
        let records = self
            .read(|| self.control_plane.list_vms())
            .await
            .map_err(|e| OrchestratorError::Internal(format!("reconciliation listing failed: {e:?}")))?;

        let mut report = ReconcileReport {
            listed: records.len(),
            ..ReconcileReport::default()
        };
        let live: HashSet<VmId> = records.iter().map(|r| r.id.clone()).collect();

        for record in records {
            let vm_id = record.id.clone();
            let _guard = self.locks.acquire_blocking(&vm_id).await;
            if let Ok(cached) = self.store.get(&vm_id).await
                && cached.power_state != record.power_state
            {
                tracing::warn!(
                    vm_id = %vm_id,
                    cached = %cached.power_state,
                    actual = %record.power_state,
                    "power state drift"
                );
                report.drifted += 1;
            }
            if self.store.upsert(record).await == UpsertOutcome::Applied {
                report.updated += 1;
            }
            if self.rebuild_tree(&vm_id).await {
                report.trees_rebuilt += 1;
            }
        }

        for cached in self.store.list(&VmFilter::default()).await {
            if live.contains(&cached.id) || cached.power_state.is_terminal() {
                continue;
            }
            // The listing may predate this record; only the control plane's
            // own answer for this VM decides whether it is gone.
            let _guard = self.locks.acquire_blocking(&cached.id).await;
            match self.read(|| self.control_plane.get_vm(&cached.id)).await {
                Err(RetryError::Rejected(ControlPlaneError::NotFound(_))) => {
                    tracing::warn!(vm_id = %cached.id, "vm vanished from control plane");
                    if self.store.mark_deleted(&cached.id).await.is_ok() {
                        self.snapshots.remove(&cached.id).await;
                        report.removed += 1;
                    }
                }
                Ok(record) => {
                    tracing::debug!(vm_id = %cached.id, "vm appeared after the listing was taken");
                    if self.store.upsert(record).await == UpsertOutcome::Applied {
                        report.updated += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(vm_id = %cached.id, error = ?err, "could not confirm vm absence, keeping it");
                }
            }
        }

        tracing::info!(
            listed = report.listed,
            updated = report.updated,
            drifted = report.drifted,
            removed = report.removed,
            trees_rebuilt = report.trees_rebuilt,
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Replaces the VM's tree if it is quarantined or its shape differs from
    /// the control plane. Returns `true` if it was replaced.
    async fn rebuild_tree(&self, vm_id: &VmId) -> bool {
        let listing = match self
            .read(|| self.control_plane.get_snapshot_tree(vm_id))
            .await
        {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(vm_id = %vm_id, error = ?err, "snapshot listing unavailable");
                return false;
            }
        };
        let handle = self.snapshots.get_or_create(vm_id).await;
        {
            let current = handle.read().await;
            if !current.is_quarantined() && same_shape(&current, &listing) {
                return false;
            }
        }
        match SnapshotTree::from_listing(vm_id.clone(), listing) {
            Ok(tree) => {
                tracing::info!(vm_id = %vm_id, snapshots = tree.len(), "snapshot tree rebuilt from control plane");
                self.snapshots.replace(tree).await;
                true
            }
            Err(err) => {
                tracing::error!(vm_id = %vm_id, error = %err, "control plane snapshot listing is inconsistent");
                false
            }
        }
    }
}

/// Compares parent links and the active pointer, ignoring metadata.
fn same_shape(tree: &SnapshotTree, listing: &SnapshotListing) -> bool {
    tree.len() == listing.nodes.len()
        && tree.active() == listing.active.as_ref()
        && listing
            .nodes
            .iter()
            .all(|node| tree.get(&node.id).is_some_and(|local| local.parent == node.parent))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::control_plane::{PowerOp, SimulatedControlPlane, SnapshotSpec, VmSpec};
    use crate::domain::{EventBus, Resources, Revision};
    use crate::persistence::MemoryCheckpointStore;

    struct Fixture {
        sim: SimulatedControlPlane,
        store: Arc<VmStateStore>,
        snapshots: Arc<SnapshotRegistry>,
        locks: Arc<VmLocks>,
        checkpoints: Arc<MemoryCheckpointStore>,
        monitor: Arc<EventMonitor>,
    }

    async fn fixture(window: usize) -> Fixture {
        let sim = SimulatedControlPlane::new();
        let _ = sim.connect().await;
        let bus = EventBus::new(256);
        let store = Arc::new(VmStateStore::new(bus.clone(), Duration::from_secs(60)));
        let snapshots = Arc::new(SnapshotRegistry::new(bus));
        let locks = Arc::new(VmLocks::new(Duration::from_secs(5)));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let monitor = Arc::new(EventMonitor::new(
            Arc::new(sim.clone()),
            Arc::clone(&store),
            Arc::clone(&snapshots),
            Arc::clone(&locks),
            Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
            MonitorSettings {
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(20),
                    randomization_factor: 0.0,
                },
                call_timeout: Duration::from_secs(1),
                reorder_window: window,
            },
        ));
        Fixture {
            sim,
            store,
            snapshots,
            locks,
            checkpoints,
            monitor,
        }
    }

    fn power(sequence: Sequence, vm: &str, revision: Revision, state: PowerState) -> VmEvent {
        VmEvent {
            sequence,
            vm_id: VmId::from(vm),
            revision,
            timestamp: Utc::now(),
            kind: EventKind::PowerChanged { power_state: state },
        }
    }

    async fn seed(f: &Fixture, name: &str) -> VmId {
        let id = f.sim.add_vm(name, Resources {
            vcpus: 1,
            memory_mib: 64,
        });
        let Some(record) = f.sim.record(&id) else {
            panic!("simulator lost {id}");
        };
        f.store.upsert(record).await;
        id
    }

    #[tokio::test]
    async fn duplicates_are_dropped() {
        let f = fixture(8).await;
        let vm = seed(&f, "a").await;
        let event = power(1, vm.as_str(), 10, PowerState::On);
        assert_eq!(f.monitor.ingest(event.clone()).await, IngestOutcome::Applied);
        assert_eq!(f.monitor.ingest(event).await, IngestOutcome::Duplicate);
        assert_eq!(f.monitor.cursor().await, 1);
    }

    #[tokio::test]
    async fn gaps_are_buffered_until_filled() {
        let f = fixture(8).await;
        let vm = seed(&f, "a").await;
        let v = vm.as_str();
        assert_eq!(
            f.monitor.ingest(power(3, v, 30, PowerState::Suspended)).await,
            IngestOutcome::Buffered
        );
        assert_eq!(
            f.monitor.ingest(power(2, v, 20, PowerState::Off)).await,
            IngestOutcome::Buffered
        );
        assert_eq!(f.monitor.pending().await, 2);
        assert_eq!(
            f.monitor.ingest(power(1, v, 10, PowerState::On)).await,
            IngestOutcome::Applied
        );
        assert_eq!(f.monitor.cursor().await, 3);
        assert_eq!(f.monitor.pending().await, 0);
        let Ok(record) = f.store.get(&vm).await else {
            panic!("vm missing");
        };
        assert_eq!(record.power_state, PowerState::Suspended);
        assert_eq!(record.revision, 30);
        assert_eq!(f.checkpoints.resume_cursor().await.ok(), Some(Some(3)));
    }

    #[tokio::test]
    async fn overflow_reconciles_and_skips_ahead() {
        let f = fixture(1).await;
        let vm = seed(&f, "a").await;
        let _ = f.sim.set_power_state(&vm, PowerState::On);
        let v = vm.as_str();
        assert_eq!(
            f.monitor.ingest(power(5, v, 50, PowerState::Off)).await,
            IngestOutcome::Buffered
        );
        assert_eq!(
            f.monitor.ingest(power(7, v, 70, PowerState::Off)).await,
            IngestOutcome::Ignored
        );
        assert_eq!(f.monitor.cursor().await, 7);
        let Ok(record) = f.store.get(&vm).await else {
            panic!("vm missing");
        };
        assert_eq!(record.power_state, PowerState::On);
        assert_eq!(f.checkpoints.resume_cursor().await.ok(), Some(Some(7)));
    }

    #[tokio::test]
    async fn events_never_resurrect_deleted_vms() {
        let f = fixture(8).await;
        let vm = seed(&f, "a").await;
        let deleted = VmEvent {
            sequence: 1,
            vm_id: vm.clone(),
            revision: 100,
            timestamp: Utc::now(),
            kind: EventKind::Deleted,
        };
        assert_eq!(f.monitor.ingest(deleted).await, IngestOutcome::Applied);
        assert_eq!(
            f.monitor
                .ingest(power(2, vm.as_str(), 200, PowerState::On))
                .await,
            IngestOutcome::Ignored
        );
        let Ok(record) = f.store.get(&vm).await else {
            panic!("tombstone missing");
        };
        assert_eq!(record.power_state, PowerState::Deleted);
    }

    #[tokio::test]
    async fn busy_vm_does_not_hold_up_other_vms() {
        let f = fixture(8).await;
        let a = seed(&f, "a").await;
        let b = seed(&f, "b").await;
        let held = f.locks.acquire_blocking(&a).await;

        let blocked = tokio::spawn({
            let monitor = Arc::clone(&f.monitor);
            let event = power(1, a.as_str(), 100, PowerState::On);
            async move { monitor.ingest(event).await }
        });
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            f.monitor.ingest(power(2, b.as_str(), 100, PowerState::On)),
        )
        .await;
        assert_eq!(other.ok(), Some(IngestOutcome::Applied));
        assert_eq!(
            tokio::time::timeout(Duration::from_millis(200), f.monitor.cursor())
                .await
                .ok(),
            Some(2)
        );
        assert_eq!(
            f.store.get(&b).await.ok().map(|r| r.power_state),
            Some(PowerState::On)
        );
        // Sequence 1 is still unapplied, so nothing may be checkpointed yet.
        assert_eq!(f.checkpoints.resume_cursor().await.ok(), Some(None));

        drop(held);
        let Ok(outcome) = blocked.await else {
            panic!("ingest task failed");
        };
        assert_eq!(outcome, IngestOutcome::Applied);
        assert_eq!(f.checkpoints.resume_cursor().await.ok(), Some(Some(2)));
    }

    #[tokio::test]
    async fn recent_events_are_newest_first_and_filterable() {
        let f = fixture(8).await;
        let vm = seed(&f, "a").await;
        let v = vm.as_str();
        let _ = f.monitor.ingest(power(1, v, 10, PowerState::On)).await;
        let _ = f.monitor.ingest(power(2, v, 20, PowerState::Off)).await;
        let _ = f
            .monitor
            .ingest(VmEvent {
                sequence: 3,
                vm_id: vm.clone(),
                revision: 30,
                timestamp: Utc::now(),
                kind: EventKind::Deleted,
            })
            .await;

        let all: Vec<Sequence> = f
            .monitor
            .recent_events(10, None)
            .await
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(all, vec![3, 2, 1]);

        let power_only = f.monitor.recent_events(1, Some(EventCategory::Power)).await;
        assert_eq!(power_only.len(), 1);
        assert_eq!(power_only.first().map(|e| e.sequence), Some(2));
    }

    #[tokio::test]
    async fn reconcile_repairs_drift_and_tombstones_missing_vms() {
        let f = fixture(8).await;
        let kept = seed(&f, "kept").await;
        let gone = seed(&f, "gone").await;
        f.sim.set_power_state_silently(&kept, PowerState::On);
        f.sim.remove_vm_silently(&gone);

        let Ok(report) = f.monitor.reconcile().await else {
            panic!("reconcile failed");
        };
        assert_eq!(report.listed, 1);
        assert_eq!(report.drifted, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(
            f.store.get(&kept).await.ok().map(|r| r.power_state),
            Some(PowerState::On)
        );
        assert_eq!(
            f.store.get(&gone).await.ok().map(|r| r.power_state),
            Some(PowerState::Deleted)
        );
    }

    #[tokio::test]
    async fn reconcile_keeps_vms_created_after_the_listing() {
        let f = fixture(8).await;
        f.sim.set_listing_delay(Some(Duration::from_millis(200)));
        let pass = tokio::spawn({
            let monitor = Arc::clone(&f.monitor);
            async move { monitor.reconcile().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let Ok(fresh) = f
            .sim
            .create_vm(&VmSpec {
                name: "fresh".to_string(),
                vcpus: 1,
                memory_mib: 64,
                guest_id: "otherGuest".to_string(),
                host: None,
                datastore: None,
            })
            .await
        else {
            panic!("create failed");
        };
        let Some(record) = f.sim.record(&fresh) else {
            panic!("simulator lost {fresh}");
        };
        f.store.upsert(record).await;

        let Ok(Ok(report)) = pass.await else {
            panic!("reconcile failed");
        };
        assert_eq!(report.listed, 0);
        assert_eq!(report.removed, 0);
        assert_eq!(
            f.store.get(&fresh).await.ok().map(|r| r.power_state),
            Some(PowerState::Off)
        );
    }

    #[tokio::test]
    async fn reconcile_rebuilds_snapshot_trees() {
        let f = fixture(8).await;
        let vm = seed(&f, "a").await;
        let spec = SnapshotSpec {
            name: "s".to_string(),
            description: String::new(),
        };
        let _ = f.sim.snapshot_create(&vm, &spec).await;
        let _ = f.sim.snapshot_create(&vm, &spec).await;

        let Ok(report) = f.monitor.reconcile().await else {
            panic!("reconcile failed");
        };
        assert_eq!(report.trees_rebuilt, 1);
        assert_eq!(f.snapshots.listing(&vm).await.nodes.len(), 2);

        let Ok(again) = f.monitor.reconcile().await else {
            panic!("reconcile failed");
        };
        assert_eq!(again.trees_rebuilt, 0);
    }

    #[tokio::test]
    async fn run_follows_the_live_feed() {
        let f = fixture(8).await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&f.monitor).run(rx));

        let spec = VmSpec {
            name: "live".to_string(),
            vcpus: 1,
            memory_mib: 64,
            guest_id: "otherGuest".to_string(),
            host: None,
            datastore: None,
        };
        let created = f.sim.create_vm(&spec);
        let Ok(vm) = created.await else {
            panic!("create failed");
        };
        let _ = f.sim.power_op(&vm, PowerOp::On).await;

        let mut changes = f.store.event_bus().subscribe();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.store.get(&vm).await.ok().map(|r| r.power_state) != Some(PowerState::On) {
            assert!(tokio::time::Instant::now() < deadline, "feed not applied");
            let _ = tokio::time::timeout(Duration::from_millis(50), changes.recv()).await;
        }

        let _ = tx.send(true);
        assert!(task.await.is_ok());
        assert_eq!(f.monitor.cursor().await, f.sim.last_sequence());
    }
}
