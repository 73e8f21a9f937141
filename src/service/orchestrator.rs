//! Lifecycle orchestrator: validates, serializes, and dispatches operations.
//!
//! Every VM-targeted operation follows the same pattern: acquire the VM's
//! exclusion token → check preconditions against the [`VmStateStore`] →
//! move into the in-flight sub-state → call the control plane under the
//! shared [`RetryPolicy`] → apply the acknowledged state at the acknowledged
//! revision. Failures never leave the record in an in-flight state: rejected
//! requests restore the prior state, exhausted retries mark the VM `Stale`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;

use super::operation::{Operation, OperationHandle, OperationOutcome, OperationStatus, SubmitMode};
use super::retry::{RetryError, RetryPolicy};
use super::vm_locks::{VmGuard, VmLocks};
use crate::control_plane::{
    CloneSource, CloneSpec, ControlPlane, ControlPlaneError, PowerOp, SnapshotSpec, VmSpec,
};
use crate::domain::{
    ConfigComparison, DatastoreUsage, HostHealth, NewSnapshot, OperationId, PowerState,
    SnapshotId, SnapshotRegistry, SnapshotTree, VmId, VmRecord, VmStateStore,
};
use crate::error::OrchestratorError;

/// Finished handles beyond this many are pruned, oldest first.
const OPERATION_TABLE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct OperationTable {
    handles: HashMap<OperationId, OperationHandle>,
    order: VecDeque<OperationId>,
}

impl OperationTable {
    fn insert(&mut self, handle: OperationHandle) {
        self.order.push_back(handle.id());
        self.handles.insert(handle.id(), handle);
        while self.handles.len() > OPERATION_TABLE_CAPACITY {
            let handles = &self.handles;
            let Some(pos) = self
                .order
                .iter()
                .position(|id| handles.get(id).is_none_or(|h| h.poll().is_finished()))
            else {
                break;
            };
            if let Some(id) = self.order.remove(pos) {
                self.handles.remove(&id);
            }
        }
    }
}

/// Name claimed by an in-flight create or clone; released on drop.
#[derive(Debug)]
struct NameReservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// Coordinates every lifecycle and snapshot operation.
#[derive(Debug)]
pub struct LifecycleOrchestrator {
    control_plane: Arc<dyn ControlPlane>,
    store: Arc<VmStateStore>,
    snapshots: Arc<SnapshotRegistry>,
    locks: Arc<VmLocks>,
    retry: RetryPolicy,
    op_timeout: Duration,
    operations: RwLock<OperationTable>,
    pending_names: Mutex<HashSet<String>>,
}

impl LifecycleOrchestrator {
    /// Creates an orchestrator over the shared store, trees, and tokens.
    #[must_use]
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        store: Arc<VmStateStore>,
        snapshots: Arc<SnapshotRegistry>,
        locks: Arc<VmLocks>,
        retry: RetryPolicy,
        op_timeout: Duration,
    ) -> Self {
        Self {
            control_plane,
            store,
            snapshots,
            locks,
            retry,
            op_timeout,
            operations: RwLock::new(OperationTable::default()),
            pending_names: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the VM record cache.
    #[must_use]
    pub fn store(&self) -> &Arc<VmStateStore> {
        &self.store
    }

    /// Returns the snapshot tree registry.
    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotRegistry> {
        &self.snapshots
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Starts `operation` in the background and returns its handle.
    ///
    /// The handle is also retained for lookup through [`Self::operation`].
    pub async fn submit(self: &Arc<Self>, operation: Operation, mode: SubmitMode) -> OperationHandle {
        let (tx, rx) = watch::channel(OperationStatus::Running);
        let cancel = CancellationToken::new();
        let handle = OperationHandle::new(&operation, rx, cancel.clone());
        self.operations.write().await.insert(handle.clone());

        let this = Arc::clone(self);
        let operation_id = handle.id();
        tokio::spawn(async move {
            let name = operation.name();
            let status = OperationStatus::from_result(this.run(operation, mode, &cancel).await);
            if let OperationStatus::Failed(err) = &status {
                tracing::warn!(%operation_id, operation = name, error = %err, "operation failed");
            } else {
                tracing::debug!(%operation_id, operation = name, status = status.as_str(), "operation finished");
            }
            let _ = tx.send(status);
        });
        handle
    }

    /// Runs `operation` to completion on the caller's task.
    ///
    /// # Errors
    ///
    /// Returns the [`OrchestratorError`] the operation failed with.
    pub async fn execute(
        &self,
        operation: Operation,
        mode: SubmitMode,
    ) -> Result<OperationOutcome, OrchestratorError> {
        self.run(operation, mode, &CancellationToken::new()).await
    }

    /// Looks up a submitted operation.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::OperationNotFound`] for unknown or
    /// pruned ids.
    pub async fn operation(&self, id: OperationId) -> Result<OperationHandle, OrchestratorError> {
        self.operations
            .read()
            .await
            .handles
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::OperationNotFound(*id.as_uuid()))
    }

    async fn run(
        &self,
        operation: Operation,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        tracing::debug!(operation = operation.name(), vm_id = ?operation.target(), "operation started");
        match operation {
            Operation::PowerOn { vm_id } => self.power_on(&vm_id, mode, cancel).await,
            Operation::PowerOff { vm_id } => self.power_off(&vm_id, mode, cancel).await,
            Operation::Suspend { vm_id } => self.suspend(&vm_id, mode, cancel).await,
            Operation::Reboot { vm_id } => self.reboot(&vm_id, mode, cancel).await,
            Operation::Delete { vm_id } => self.delete(&vm_id, mode, cancel).await,
            Operation::Create { spec } => self.create(&spec, cancel).await,
            Operation::Clone { source, spec } => self.clone_vm(&source, &spec, mode, cancel).await,
            Operation::MarkTemplate { vm_id } => self.mark_template(&vm_id, mode, cancel).await,
            Operation::SnapshotCreate { vm_id, spec } => {
                self.snapshot_create(&vm_id, &spec, mode, cancel).await
            }
            Operation::SnapshotDelete { vm_id, snapshot_id } => {
                self.snapshot_delete(&vm_id, &snapshot_id, mode, cancel).await
            }
            Operation::SnapshotRevert { vm_id, snapshot_id } => {
                self.snapshot_revert(&vm_id, &snapshot_id, mode, cancel).await
            }
        }
    }

    // ── Power ───────────────────────────────────────────────────────────

    async fn power_on(
        &self,
        vm_id: &VmId,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        if record.is_template {
            return Err(invalid_state(vm_id, "power_on", record.power_state));
        }
        match record.power_state {
            PowerState::On => Ok(OperationOutcome::noop(vm_id.clone(), PowerState::On)),
            PowerState::Off | PowerState::Suspended => {
                let state = self.dispatch_power(vm_id, PowerOp::On, cancel).await?;
                Ok(OperationOutcome::new(vm_id.clone(), state))
            }
            state => Err(invalid_state(vm_id, "power_on", state)),
        }
    }

    async fn power_off(
        &self,
        vm_id: &VmId,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        match record.power_state {
            PowerState::Off => Ok(OperationOutcome::noop(vm_id.clone(), PowerState::Off)),
            PowerState::On | PowerState::Suspended => {
                let state = self.dispatch_power(vm_id, PowerOp::Off, cancel).await?;
                Ok(OperationOutcome::new(vm_id.clone(), state))
            }
            state => Err(invalid_state(vm_id, "power_off", state)),
        }
    }

    async fn suspend(
        &self,
        vm_id: &VmId,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        match record.power_state {
            PowerState::Suspended => Ok(OperationOutcome::noop(vm_id.clone(), PowerState::Suspended)),
            PowerState::On => {
                let state = self.dispatch_power(vm_id, PowerOp::Suspend, cancel).await?;
                Ok(OperationOutcome::new(vm_id.clone(), state))
            }
            state => Err(invalid_state(vm_id, "suspend", state)),
        }
    }

    async fn reboot(
        &self,
        vm_id: &VmId,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        if record.power_state != PowerState::On {
            return Err(invalid_state(vm_id, "reboot", record.power_state));
        }
        self.dispatch_power(vm_id, PowerOp::Off, cancel).await?;
        let state = self.dispatch_power(vm_id, PowerOp::On, cancel).await?;
        tracing::info!(vm_id = %vm_id, "vm rebooted");
        Ok(OperationOutcome::new(vm_id.clone(), state))
    }

    /// Issues one power command. The caller holds the VM's token and has
    /// checked preconditions.
    async fn dispatch_power(
        &self,
        vm_id: &VmId,
        op: PowerOp,
        cancel: &CancellationToken,
    ) -> Result<PowerState, OrchestratorError> {
        let (name, in_flight, target) = match op {
            PowerOp::On => ("power_on", Some(PowerState::PoweringOn), PowerState::On),
            PowerOp::Off => ("power_off", Some(PowerState::PoweringOff), PowerState::Off),
            PowerOp::Suspend => ("suspend", None, PowerState::Suspended),
        };
        let before = match in_flight {
            Some(state) => self.store.transition(vm_id, state, name).await?,
            None => self.store.get(vm_id).await?,
        };

        match self.call(cancel, || self.control_plane.power_op(vm_id, op)).await {
            Ok(ack) => {
                self.store
                    .apply_confirmed(vm_id, target, ack.revision)
                    .await?;
                tracing::info!(vm_id = %vm_id, %op, state = %target, revision = ack.revision, "power command acknowledged");
                Ok(target)
            }
            Err(failure) => Err(self.settle(vm_id, before.power_state, failure).await),
        }
    }

    // ── Create / clone / delete / template ──────────────────────────────

    async fn create(
        &self,
        spec: &VmSpec,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        if spec.vcpus == 0 || spec.memory_mib == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "vcpus and memory_mib must be positive".to_string(),
            ));
        }
        let _name = self.reserve_name(&spec.name).await?;

        let vm_id = match self.call(cancel, || self.control_plane.create_vm(spec)).await {
            Ok(vm_id) => vm_id,
            Err(failure) => return Err(creation_failed(&spec.name, failure)),
        };
        let record = self.adopt(&vm_id, cancel).await?;
        tracing::info!(vm_id = %vm_id, name = %spec.name, "vm created");
        Ok(OperationOutcome::new(vm_id, record.power_state))
    }

    async fn clone_vm(
        &self,
        source: &CloneSource,
        spec: &CloneSpec,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _name = self.reserve_name(&spec.name).await?;
        let source_vm = source.source_vm();

        let (vm_id, baseline) = {
            let _guard = self.lock(source_vm, mode).await?;
            let record = self.store.get(source_vm).await?;
            let baseline = match source {
                CloneSource::Template { .. } => {
                    if !record.is_template {
                        return Err(OrchestratorError::InvalidRequest(format!(
                            "{source_vm} is not a template"
                        )));
                    }
                    PowerState::Off
                }
                CloneSource::Snapshot { snapshot_id, .. } => {
                    let tree = self.snapshots.get_or_create(source_vm).await;
                    let request = tree
                        .read()
                        .await
                        .clone_from(snapshot_id)
                        .map_err(|e| e.with_last_known(record.power_state))?;
                    tracing::debug!(
                        vm_id = %source_vm,
                        snapshot_id = %request.snapshot_id,
                        baseline = %request.baseline_power,
                        "cloning from snapshot"
                    );
                    request.baseline_power
                }
            };

            match self
                .call(cancel, || self.control_plane.clone_vm(source, spec))
                .await
            {
                Ok(vm_id) => (vm_id, baseline),
                Err(failure) => return Err(creation_failed(&spec.name, failure)),
            }
        };

        let record = self.adopt(&vm_id, cancel).await?;
        tracing::info!(vm_id = %vm_id, source = %source_vm, "vm cloned");
        if spec.power_on || baseline == PowerState::On {
            let mut outcome = self.power_on(&vm_id, SubmitMode::Wait, cancel).await?;
            outcome.noop = false;
            return Ok(outcome);
        }
        Ok(OperationOutcome::new(vm_id, record.power_state))
    }

    async fn delete(
        &self,
        vm_id: &VmId,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        match record.power_state {
            PowerState::Deleted => {
                return Ok(OperationOutcome::noop(vm_id.clone(), PowerState::Deleted));
            }
            PowerState::Off | PowerState::On | PowerState::Suspended => {}
            state => return Err(invalid_state(vm_id, "delete", state)),
        }

        let before = self.store.transition(vm_id, PowerState::Deleting, "delete").await?;
        match self.call(cancel, || self.control_plane.delete_vm(vm_id)).await {
            Ok(ack) => {
                self.store
                    .apply_confirmed(vm_id, PowerState::Deleted, ack.revision)
                    .await?;
            }
            Err(RetryError::Rejected(ControlPlaneError::NotFound(_))) => {
                tracing::info!(vm_id = %vm_id, "vm already absent from control plane");
                self.store.mark_deleted(vm_id).await?;
            }
            Err(failure) => return Err(self.settle(vm_id, before.power_state, failure).await),
        }
        self.snapshots.remove(vm_id).await;
        Ok(OperationOutcome::new(vm_id.clone(), PowerState::Deleted))
    }

    async fn mark_template(
        &self,
        vm_id: &VmId,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        if record.is_template {
            return Ok(OperationOutcome::noop(vm_id.clone(), record.power_state));
        }
        if record.power_state != PowerState::Off {
            return Err(invalid_state(vm_id, "mark_template", record.power_state));
        }

        let ack = match self.call(cancel, || self.control_plane.mark_template(vm_id)).await {
            Ok(ack) => ack,
            Err(failure) => return Err(self.settle(vm_id, record.power_state, failure).await),
        };
        let mut updated = record;
        updated.is_template = true;
        updated.revision = updated.revision.max(ack.revision);
        self.store.upsert(updated).await;
        tracing::info!(vm_id = %vm_id, "vm marked as template");
        Ok(OperationOutcome::new(vm_id.clone(), PowerState::Off))
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    async fn snapshot_create(
        &self,
        vm_id: &VmId,
        spec: &SnapshotSpec,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        if record.is_template
            || !matches!(record.power_state, PowerState::Off | PowerState::On)
        {
            return Err(invalid_state(vm_id, "snapshot_create", record.power_state));
        }
        let tree = self.snapshots.get_or_create(vm_id).await;
        tree.read().await.ensure_usable()?;

        let ack = match self
            .call(cancel, || self.control_plane.snapshot_create(vm_id, spec))
            .await
        {
            Ok(ack) => ack,
            Err(failure) => return Err(self.settle(vm_id, record.power_state, failure).await),
        };

        let mut tree = tree.write().await;
        let created = tree
            .create(NewSnapshot {
                id: ack.snapshot_id.clone(),
                name: spec.name.clone(),
                description: spec.description.clone(),
                created_at: Utc::now(),
                power_state: record.power_state,
                resources: record.resources,
            })
            .map(|_| ());
        self.snapshots.publish(&tree);
        created?;
        tracing::info!(vm_id = %vm_id, snapshot_id = %ack.snapshot_id, "snapshot created");
        Ok(OperationOutcome::new(vm_id.clone(), record.power_state).with_snapshot(ack.snapshot_id))
    }

    async fn snapshot_delete(
        &self,
        vm_id: &VmId,
        snapshot_id: &SnapshotId,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        let tree = self.snapshots.get_or_create(vm_id).await;
        require_snapshot(&*tree.read().await, snapshot_id, record.power_state)?;

        if let Err(failure) = self
            .call(cancel, || self.control_plane.snapshot_delete(vm_id, snapshot_id))
            .await
        {
            return Err(self.settle(vm_id, record.power_state, failure).await);
        }

        let mut tree = tree.write().await;
        let deleted = tree.delete(snapshot_id).map(|_| ());
        self.snapshots.publish(&tree);
        deleted?;
        tracing::info!(vm_id = %vm_id, snapshot_id = %snapshot_id, "snapshot deleted");
        Ok(OperationOutcome::new(vm_id.clone(), record.power_state)
            .with_snapshot(snapshot_id.clone()))
    }

    async fn snapshot_revert(
        &self,
        vm_id: &VmId,
        snapshot_id: &SnapshotId,
        mode: SubmitMode,
        cancel: &CancellationToken,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let _guard = self.lock(vm_id, mode).await?;
        let record = self.store.get(vm_id).await?;
        let tree = self.snapshots.get_or_create(vm_id).await;
        let recorded = require_snapshot(&*tree.read().await, snapshot_id, record.power_state)?;
        if record.is_template {
            return Err(invalid_state(vm_id, "snapshot_revert", record.power_state));
        }

        match record.power_state {
            PowerState::Off => {}
            PowerState::On | PowerState::Suspended => {
                self.dispatch_power(vm_id, PowerOp::Off, cancel).await?;
            }
            state => return Err(invalid_state(vm_id, "snapshot_revert", state)),
        }

        let ack = match self
            .call(cancel, || self.control_plane.snapshot_revert(vm_id, snapshot_id))
            .await
        {
            Ok(ack) => ack,
            Err(failure) => return Err(self.settle(vm_id, PowerState::Off, failure).await),
        };
        {
            let mut tree = tree.write().await;
            let reverted = tree.revert(snapshot_id).map(|_| ());
            self.snapshots.publish(&tree);
            reverted?;
        }
        self.store
            .apply_confirmed(vm_id, PowerState::Off, ack.revision)
            .await?;

        let state = if recorded == PowerState::On {
            self.dispatch_power(vm_id, PowerOp::On, cancel).await?
        } else {
            PowerState::Off
        };
        tracing::info!(vm_id = %vm_id, snapshot_id = %snapshot_id, state = %state, "vm reverted to snapshot");
        Ok(OperationOutcome::new(vm_id.clone(), state).with_snapshot(snapshot_id.clone()))
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Returns a copy of the VM's snapshot tree.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::VmNotFound`] if the VM is unknown.
    pub async fn snapshot_tree(&self, vm_id: &VmId) -> Result<SnapshotTree, OrchestratorError> {
        self.store.get(vm_id).await?;
        Ok(match self.snapshots.get(vm_id).await {
            Some(tree) => tree.read().await.clone(),
            None => SnapshotTree::new(vm_id.clone()),
        })
    }

    /// Compares the VM's current allocation with a snapshot's.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::VmNotFound`] if the VM is unknown.
    /// - [`OrchestratorError::SnapshotNotFound`] if the snapshot is absent.
    pub async fn compare(
        &self,
        vm_id: &VmId,
        snapshot_id: &SnapshotId,
    ) -> Result<ConfigComparison, OrchestratorError> {
        let record = self.store.get(vm_id).await?;
        let compared = match self.snapshots.get(vm_id).await {
            Some(tree) => tree.read().await.compare(snapshot_id, record.resources),
            None => SnapshotTree::new(vm_id.clone()).compare(snapshot_id, record.resources),
        };
        compared.map_err(|e| e.with_last_known(record.power_state))
    }

    /// Lists hypervisor hosts.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Internal`] if the control plane cannot
    /// be read.
    pub async fn list_hosts(&self) -> Result<Vec<HostHealth>, OrchestratorError> {
        self.call(&CancellationToken::new(), || self.control_plane.list_hosts())
            .await
            .map_err(|e| inventory_failed("hosts", &e))
    }

    /// Lists datastores.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Internal`] if the control plane cannot
    /// be read.
    pub async fn list_datastores(&self) -> Result<Vec<DatastoreUsage>, OrchestratorError> {
        self.call(&CancellationToken::new(), || self.control_plane.list_datastores())
            .await
            .map_err(|e| inventory_failed("datastores", &e))
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    async fn lock(&self, vm_id: &VmId, mode: SubmitMode) -> Result<VmGuard, OrchestratorError> {
        match self.locks.acquire(vm_id, mode).await {
            Ok(guard) => Ok(guard),
            Err(err) => Err(match self.store.get(vm_id).await {
                Ok(record) => err.with_last_known(record.power_state),
                Err(_) => err,
            }),
        }
    }

    async fn call<T, F, Fut>(&self, cancel: &CancellationToken, call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ControlPlaneError>>,
    {
        self.retry.run(self.op_timeout, cancel, call).await
    }

    /// Claims `name` for a create or clone until the returned reservation
    /// drops. The claim is taken before the cache is checked, so a racing
    /// request either sees the claim or the cached record.
    async fn reserve_name(&self, name: &str) -> Result<NameReservation<'_>, OrchestratorError> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "vm name must not be empty".to_string(),
            ));
        }
        let claimed = self
            .pending_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        if !claimed {
            return Err(OrchestratorError::InvalidRequest(format!(
                "a vm named {name} is already being created"
            )));
        }
        let reservation = NameReservation {
            pending: &self.pending_names,
            name: name.to_string(),
        };
        if self.store.contains_name(name).await {
            return Err(OrchestratorError::InvalidRequest(format!(
                "a vm named {name} already exists"
            )));
        }
        Ok(reservation)
    }

    /// Reads a freshly created VM back from the control plane and caches it.
    async fn adopt(&self, vm_id: &VmId, cancel: &CancellationToken) -> Result<VmRecord, OrchestratorError> {
        let record = match self.call(cancel, || self.control_plane.get_vm(vm_id)).await {
            Ok(record) => record,
            Err(failure) => return Err(creation_failed(vm_id.as_str(), failure)),
        };
        self.store.upsert(record.clone()).await;
        let _ = self.snapshots.get_or_create(vm_id).await;
        Ok(record)
    }

    /// Converts a failed dispatch into the caller-facing error and leaves
    /// the record out of any in-flight state.
    async fn settle(&self, vm_id: &VmId, before: PowerState, failure: RetryError) -> OrchestratorError {
        match failure {
            RetryError::Rejected(err) => {
                self.restore(vm_id, before).await;
                tracing::warn!(vm_id = %vm_id, error = %err, "control plane rejected operation");
                OrchestratorError::OperationRejected {
                    vm_id: vm_id.clone(),
                    reason: err.to_string(),
                    last_known: Some(before),
                }
            }
            RetryError::Exhausted { attempts, last } => {
                tracing::error!(vm_id = %vm_id, attempts, error = %last, "operation timed out");
                self.mark_stale(vm_id).await;
                OrchestratorError::OperationTimedOut {
                    vm_id: vm_id.clone(),
                    attempts,
                    last_known: Some(before),
                }
            }
            RetryError::Cancelled { attempts } => {
                // A dispatched request may still land; let reconciliation decide.
                if attempts == 0 {
                    self.restore(vm_id, before).await;
                } else {
                    self.mark_stale(vm_id).await;
                }
                tracing::info!(vm_id = %vm_id, attempts, "operation cancelled");
                OrchestratorError::Cancelled {
                    vm_id: vm_id.clone(),
                    last_known: Some(before),
                }
            }
        }
    }

    async fn restore(&self, vm_id: &VmId, state: PowerState) {
        let Ok(current) = self.store.get(vm_id).await else {
            return;
        };
        if current.power_state.is_in_flight() && current.power_state != state {
            if let Err(err) = self.store.transition(vm_id, state, "restore").await {
                tracing::warn!(vm_id = %vm_id, error = %err, "could not restore prior state");
            }
        }
    }

    async fn mark_stale(&self, vm_id: &VmId) {
        if let Err(err) = self.store.mark_stale(vm_id).await {
            tracing::warn!(vm_id = %vm_id, error = %err, "could not mark vm stale");
        }
    }
}

fn invalid_state(vm_id: &VmId, operation: &'static str, state: PowerState) -> OrchestratorError {
    OrchestratorError::InvalidState {
        vm_id: vm_id.clone(),
        operation,
        state,
    }
}

/// Checks the tree is usable and holds `snapshot_id`; returns the power
/// state recorded in the snapshot.
fn require_snapshot(
    tree: &SnapshotTree,
    snapshot_id: &SnapshotId,
    last_known: PowerState,
) -> Result<PowerState, OrchestratorError> {
    tree.ensure_usable()?;
    tree.get(snapshot_id)
        .map(|node| node.power_state)
        .ok_or_else(|| OrchestratorError::SnapshotNotFound {
            vm_id: tree.vm_id().clone(),
            snapshot_id: snapshot_id.clone(),
            last_known: Some(last_known),
        })
}

/// Failures of create and clone name the requested VM, which has no id yet.
fn creation_failed(name: &str, failure: RetryError) -> OrchestratorError {
    let vm_id = VmId::new(name);
    match failure {
        RetryError::Rejected(err) => OrchestratorError::OperationRejected {
            vm_id,
            reason: err.to_string(),
            last_known: None,
        },
        RetryError::Exhausted { attempts, .. } => OrchestratorError::OperationTimedOut {
            vm_id,
            attempts,
            last_known: None,
        },
        RetryError::Cancelled { .. } => OrchestratorError::Cancelled {
            vm_id,
            last_known: None,
        },
    }
}

fn inventory_failed(what: &str, failure: &RetryError) -> OrchestratorError {
    OrchestratorError::Internal(format!("cannot list {what}: {failure:?}"))
}
