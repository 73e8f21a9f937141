//! In-memory control plane with fault injection and call tracing.
//!
//! [`SimulatedControlPlane`] keeps a small inventory (hosts, datastores, VMs
//! with snapshot trees), assigns revisions and event sequence numbers the way
//! a real control plane would, and publishes every change on its event feed.
//! Tests use the hooks at the bottom of the impl to inject faults, add
//! latency, change state out of band, and drop event streams.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::broadcast;

use super::{
    Ack, CloneSource, CloneSpec, ControlPlane, ControlPlaneError, EventStream, PowerOp,
    SnapshotAck, SnapshotSpec, VmSpec,
};
use crate::domain::{
    DatastoreUsage, EventKind, HostHealth, NewSnapshot, PowerState, Resources, Revision, Sequence,
    SnapshotId, SnapshotListing, SnapshotTree, VmEvent, VmId, VmRecord,
};

/// Failure to inject into the next call that targets a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Never acknowledge (the call pends forever).
    Hang,
    /// Fail with [`ControlPlaneError::Timeout`].
    Timeout,
    /// Fail with [`ControlPlaneError::RateLimited`].
    RateLimited,
    /// Fail with [`ControlPlaneError::PermissionDenied`].
    PermissionDenied,
    /// Fail with [`ControlPlaneError::Disconnected`].
    Disconnect,
}

/// One traced call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Trait method name (e.g. `"power_op"`).
    pub method: &'static str,
    /// Targeted VM, if any.
    pub vm_id: Option<VmId>,
}

#[derive(Debug)]
struct SimVm {
    record: VmRecord,
    snapshots: SnapshotTree,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    vms: BTreeMap<VmId, SimVm>,
    hosts: Vec<HostHealth>,
    datastores: Vec<DatastoreUsage>,
    next_vm: u64,
    next_snapshot: u64,
    next_revision: Revision,
    next_sequence: Sequence,
    log: Vec<VmEvent>,
    faults: HashMap<VmId, VecDeque<Fault>>,
    calls: Vec<CallRecord>,
    latency: Option<Duration>,
    listing_delay: Option<Duration>,
    events: broadcast::Sender<VmEvent>,
}

impl SimState {
    fn revision(&mut self) -> Revision {
        self.next_revision += 1;
        self.next_revision
    }

    fn emit(&mut self, vm_id: &VmId, revision: Revision, kind: EventKind) {
        self.next_sequence += 1;
        let event = VmEvent {
            sequence: self.next_sequence,
            vm_id: vm_id.clone(),
            revision,
            timestamp: Utc::now(),
            kind,
        };
        self.log.push(event.clone());
        let _ = self.events.send(event);
    }

    fn vm_mut(&mut self, id: &VmId) -> Result<&mut SimVm, ControlPlaneError> {
        self.vms
            .get_mut(id)
            .ok_or_else(|| ControlPlaneError::NotFound(id.to_string()))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.vms.values().any(|vm| vm.record.name == name)
    }

    fn insert_vm(&mut self, name: String, resources: Resources, host: Option<String>, datastore: Option<String>) -> VmId {
        self.next_vm += 1;
        let id = VmId::new(format!("vm-{}", self.next_vm));
        let revision = self.revision();
        let record = VmRecord {
            id: id.clone(),
            name,
            power_state: PowerState::Off,
            host: host.or_else(|| self.hosts.first().map(|h| h.name.clone())),
            datastores: datastore
                .or_else(|| self.datastores.first().map(|d| d.name.clone()))
                .into_iter()
                .collect(),
            resources,
            is_template: false,
            revision,
        };
        self.vms.insert(
            id.clone(),
            SimVm {
                record: record.clone(),
                snapshots: SnapshotTree::new(id.clone()),
            },
        );
        self.emit(&id, revision, EventKind::Created { record });
        id
    }

    fn set_power(&mut self, id: &VmId, state: PowerState) -> Result<Revision, ControlPlaneError> {
        let revision = self.revision();
        let vm = self.vm_mut(id)?;
        vm.record.power_state = state;
        vm.record.revision = revision;
        self.emit(id, revision, EventKind::PowerChanged { power_state: state });
        Ok(revision)
    }
}

/// In-memory [`ControlPlane`] implementation.
#[derive(Debug, Clone)]
pub struct SimulatedControlPlane {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedControlPlane {
    /// Creates an empty, disconnected simulator with one host and one
    /// datastore.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(4096);
        let state = SimState {
            connected: false,
            vms: BTreeMap::new(),
            hosts: vec![HostHealth {
                name: "DC0_H0".to_string(),
                vendor: "VMware, Inc. (govmomi simulator)".to_string(),
                model: "VMware Virtual Platform".to_string(),
                cpu_model: "Intel(R) Core(TM) i7-3615QM CPU @ 2.30GHz".to_string(),
                cpu_packages: 2,
                cpu_cores: 2,
                memory_bytes: 4 * 1024 * 1024 * 1024,
                connection_state: "connected".to_string(),
                power_state: "poweredOn".to_string(),
                overall_status: "green".to_string(),
            }],
            datastores: vec![DatastoreUsage {
                name: "LocalDS_0".to_string(),
                capacity_bytes: 100 * 1024 * 1024 * 1024,
                free_bytes: 60 * 1024 * 1024 * 1024,
            }],
            next_vm: 0,
            next_snapshot: 0,
            next_revision: 0,
            next_sequence: 0,
            log: Vec::new(),
            faults: HashMap::new(),
            calls: Vec::new(),
            latency: None,
            listing_delay: None,
            events,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Creates a simulator seeded like a fresh `vcsim`: two powered-on VMs
    /// on the default host.
    #[must_use]
    pub fn with_default_inventory() -> Self {
        let sim = Self::new();
        for name in ["DC0_H0_VM0", "DC0_H0_VM1"] {
            let id = sim.add_vm(name, Resources {
                vcpus: 1,
                memory_mib: 32,
            });
            let _ = sim.lock().set_power(&id, PowerState::On);
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call, then applies latency and any queued fault.
    async fn dispatch(&self, method: &'static str, vm_id: Option<&VmId>) -> Result<(), ControlPlaneError> {
        let (latency, fault) = {
            let mut state = self.lock();
            state.calls.push(CallRecord {
                method,
                vm_id: vm_id.cloned(),
            });
            if !state.connected {
                return Err(ControlPlaneError::Disconnected);
            }
            let fault = vm_id
                .and_then(|id| state.faults.get_mut(id))
                .and_then(VecDeque::pop_front);
            (state.latency, fault)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match fault {
            None => Ok(()),
            Some(Fault::Hang) => futures_util::future::pending().await,
            Some(Fault::Timeout) => Err(ControlPlaneError::Timeout),
            Some(Fault::RateLimited) => Err(ControlPlaneError::RateLimited {
                retry_after: Some(Duration::from_millis(50)),
            }),
            Some(Fault::PermissionDenied) => Err(ControlPlaneError::PermissionDenied(
                format!("{method} not permitted"),
            )),
            Some(Fault::Disconnect) => Err(ControlPlaneError::Disconnected),
        }
    }

    // ── Test hooks ──────────────────────────────────────────────────────

    /// Adds a powered-off VM without going through `create_vm` tracing.
    pub fn add_vm(&self, name: &str, resources: Resources) -> VmId {
        self.lock().insert_vm(name.to_string(), resources, None, None)
    }

    /// Queues a fault for the next call that targets `vm_id`.
    pub fn inject_fault(&self, vm_id: &VmId, fault: Fault) {
        self.lock()
            .faults
            .entry(vm_id.clone())
            .or_default()
            .push_back(fault);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Delays `list_vms` answers by `delay` after the listing is taken, so
    /// the caller receives an already stale view.
    pub fn set_listing_delay(&self, delay: Option<Duration>) {
        self.lock().listing_delay = delay;
    }

    /// Returns every traced call.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Counts traced calls of `method` against `vm_id`.
    #[must_use]
    pub fn count_calls(&self, method: &str, vm_id: &VmId) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method && c.vm_id.as_ref() == Some(vm_id))
            .count()
    }

    /// Changes a VM's power state out of band (as if done in another
    /// client), emitting the matching event.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::NotFound`] if the VM does not exist.
    pub fn set_power_state(&self, vm_id: &VmId, state: PowerState) -> Result<Revision, ControlPlaneError> {
        self.lock().set_power(vm_id, state)
    }

    /// Changes a VM's power state without emitting an event (lost event).
    pub fn set_power_state_silently(&self, vm_id: &VmId, state: PowerState) {
        let mut sim = self.lock();
        let revision = sim.revision();
        if let Some(vm) = sim.vms.get_mut(vm_id) {
            vm.record.power_state = state;
            vm.record.revision = revision;
        }
    }

    /// Removes a VM without emitting an event (lost event).
    pub fn remove_vm_silently(&self, vm_id: &VmId) {
        self.lock().vms.remove(vm_id);
    }

    /// Appends a raw event to the feed, bypassing sequence assignment.
    pub fn inject_event(&self, event: VmEvent) {
        let mut sim = self.lock();
        sim.next_sequence = sim.next_sequence.max(event.sequence);
        sim.log.push(event.clone());
        let _ = sim.events.send(event);
    }

    /// Ends every open event stream, as a dropped session would.
    pub fn drop_event_streams(&self) {
        let (events, _) = broadcast::channel(4096);
        self.lock().events = events;
    }

    /// Highest sequence number emitted so far.
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        self.lock().next_sequence
    }

    /// Current authoritative record of a VM.
    #[must_use]
    pub fn record(&self, vm_id: &VmId) -> Option<VmRecord> {
        self.lock().vms.get(vm_id).map(|vm| vm.record.clone())
    }
}

#[async_trait]
impl ControlPlane for SimulatedControlPlane {
    async fn connect(&self) -> Result<(), ControlPlaneError> {
        self.lock().connected = true;
        tracing::info!("connected to simulated control plane");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ControlPlaneError> {
        self.lock().connected = false;
        self.drop_event_streams();
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<VmRecord>, ControlPlaneError> {
        self.dispatch("list_vms", None).await?;
        let (records, delay) = {
            let sim = self.lock();
            let records: Vec<VmRecord> = sim.vms.values().map(|vm| vm.record.clone()).collect();
            (records, sim.listing_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(records)
    }

    async fn get_vm(&self, id: &VmId) -> Result<VmRecord, ControlPlaneError> {
        self.dispatch("get_vm", Some(id)).await?;
        Ok(self.lock().vm_mut(id)?.record.clone())
    }

    async fn power_op(&self, id: &VmId, op: PowerOp) -> Result<Ack, ControlPlaneError> {
        self.dispatch("power_op", Some(id)).await?;
        let mut sim = self.lock();
        let vm = sim.vm_mut(id)?;
        let current = vm.record.power_state;
        if vm.record.is_template {
            return Err(ControlPlaneError::Invalid(format!("{id} is a template")));
        }
        let next = match (op, current) {
            (PowerOp::On, PowerState::Off | PowerState::Suspended) => PowerState::On,
            (PowerOp::Off, PowerState::On | PowerState::Suspended) => PowerState::Off,
            (PowerOp::Suspend, PowerState::On) => PowerState::Suspended,
            _ => {
                return Err(ControlPlaneError::Invalid(format!(
                    "power {op} not allowed while {current}"
                )));
            }
        };
        let revision = sim.set_power(id, next)?;
        Ok(Ack { revision })
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<VmId, ControlPlaneError> {
        self.dispatch("create_vm", None).await?;
        let mut sim = self.lock();
        if sim.name_taken(&spec.name) {
            return Err(ControlPlaneError::Invalid(format!(
                "duplicate name {}",
                spec.name
            )));
        }
        let resources = Resources {
            vcpus: spec.vcpus,
            memory_mib: spec.memory_mib,
        };
        Ok(sim.insert_vm(
            spec.name.clone(),
            resources,
            spec.host.clone(),
            spec.datastore.clone(),
        ))
    }

    async fn delete_vm(&self, id: &VmId) -> Result<Ack, ControlPlaneError> {
        self.dispatch("delete_vm", Some(id)).await?;
        let mut sim = self.lock();
        sim.vms
            .remove(id)
            .ok_or_else(|| ControlPlaneError::NotFound(id.to_string()))?;
        let revision = sim.revision();
        sim.emit(id, revision, EventKind::Deleted);
        Ok(Ack { revision })
    }

    async fn clone_vm(
        &self,
        source: &CloneSource,
        spec: &CloneSpec,
    ) -> Result<VmId, ControlPlaneError> {
        self.dispatch("clone_vm", Some(source.source_vm())).await?;
        let mut sim = self.lock();
        if sim.name_taken(&spec.name) {
            return Err(ControlPlaneError::Invalid(format!(
                "duplicate name {}",
                spec.name
            )));
        }
        let (resources, host, datastore) = {
            let vm = sim.vm_mut(source.source_vm())?;
            let resources = match source {
                CloneSource::Template { template } => {
                    if !vm.record.is_template {
                        return Err(ControlPlaneError::Invalid(format!(
                            "{template} is not a template"
                        )));
                    }
                    vm.record.resources
                }
                CloneSource::Snapshot { snapshot_id, .. } => {
                    vm.snapshots
                        .get(snapshot_id)
                        .ok_or_else(|| ControlPlaneError::NotFound(snapshot_id.to_string()))?
                        .resources
                }
            };
            (
                resources,
                spec.host.clone().or_else(|| vm.record.host.clone()),
                spec.datastore
                    .clone()
                    .or_else(|| vm.record.datastores.first().cloned()),
            )
        };
        Ok(sim.insert_vm(spec.name.clone(), resources, host, datastore))
    }

    async fn mark_template(&self, id: &VmId) -> Result<Ack, ControlPlaneError> {
        self.dispatch("mark_template", Some(id)).await?;
        let mut sim = self.lock();
        let revision = sim.revision();
        let vm = sim.vm_mut(id)?;
        if vm.record.power_state != PowerState::Off {
            return Err(ControlPlaneError::Invalid(format!(
                "{id} must be powered off"
            )));
        }
        vm.record.is_template = true;
        vm.record.revision = revision;
        Ok(Ack { revision })
    }

    async fn snapshot_create(
        &self,
        id: &VmId,
        spec: &SnapshotSpec,
    ) -> Result<SnapshotAck, ControlPlaneError> {
        self.dispatch("snapshot_create", Some(id)).await?;
        let mut sim = self.lock();
        sim.next_snapshot += 1;
        let snapshot_id = SnapshotId::new(format!("snapshot-{}", sim.next_snapshot));
        let revision = sim.revision();
        let vm = sim.vm_mut(id)?;
        let node = vm
            .snapshots
            .create(NewSnapshot {
                id: snapshot_id.clone(),
                name: spec.name.clone(),
                description: spec.description.clone(),
                created_at: Utc::now(),
                power_state: vm.record.power_state,
                resources: vm.record.resources,
            })
            .map_err(|e| ControlPlaneError::Invalid(e.to_string()))?
            .clone();
        vm.record.revision = revision;
        sim.emit(id, revision, EventKind::SnapshotCreated { node });
        Ok(SnapshotAck {
            snapshot_id,
            revision,
        })
    }

    async fn snapshot_delete(
        &self,
        id: &VmId,
        snapshot: &SnapshotId,
    ) -> Result<Ack, ControlPlaneError> {
        self.dispatch("snapshot_delete", Some(id)).await?;
        let mut sim = self.lock();
        let revision = sim.revision();
        let vm = sim.vm_mut(id)?;
        vm.snapshots
            .delete(snapshot)
            .map_err(|_| ControlPlaneError::NotFound(snapshot.to_string()))?;
        vm.record.revision = revision;
        sim.emit(
            id,
            revision,
            EventKind::SnapshotRemoved {
                snapshot_id: snapshot.clone(),
            },
        );
        Ok(Ack { revision })
    }

    async fn snapshot_revert(
        &self,
        id: &VmId,
        snapshot: &SnapshotId,
    ) -> Result<Ack, ControlPlaneError> {
        self.dispatch("snapshot_revert", Some(id)).await?;
        let mut sim = self.lock();
        let revision = sim.revision();
        let vm = sim.vm_mut(id)?;
        vm.snapshots
            .revert(snapshot)
            .map_err(|_| ControlPlaneError::NotFound(snapshot.to_string()))?;
        // Disk-only snapshots: the reverted VM comes back powered off.
        let was = vm.record.power_state;
        vm.record.power_state = PowerState::Off;
        vm.record.revision = revision;
        sim.emit(
            id,
            revision,
            EventKind::SnapshotReverted {
                snapshot_id: snapshot.clone(),
            },
        );
        if was != PowerState::Off {
            sim.emit(
                id,
                revision,
                EventKind::PowerChanged {
                    power_state: PowerState::Off,
                },
            );
        }
        Ok(Ack { revision })
    }

    async fn get_snapshot_tree(&self, id: &VmId) -> Result<SnapshotListing, ControlPlaneError> {
        self.dispatch("get_snapshot_tree", Some(id)).await?;
        Ok(self.lock().vm_mut(id)?.snapshots.listing())
    }

    async fn list_hosts(&self) -> Result<Vec<HostHealth>, ControlPlaneError> {
        self.dispatch("list_hosts", None).await?;
        Ok(self.lock().hosts.clone())
    }

    async fn list_datastores(&self) -> Result<Vec<DatastoreUsage>, ControlPlaneError> {
        self.dispatch("list_datastores", None).await?;
        Ok(self.lock().datastores.clone())
    }

    fn subscribe_events(&self, since: Sequence) -> EventStream {
        let (backlog, rx) = {
            let sim = self.lock();
            if !sim.connected {
                return stream::once(async { Err(ControlPlaneError::Disconnected) }).boxed();
            }
            let rx = sim.events.subscribe();
            let backlog: VecDeque<VmEvent> = sim
                .log
                .iter()
                .filter(|e| e.sequence > since)
                .cloned()
                .collect();
            (backlog, rx)
        };
        let replayed_upto = backlog.back().map_or(since, |e| e.sequence);

        stream::unfold((backlog, rx), move |(mut backlog, mut rx)| async move {
            if let Some(event) = backlog.pop_front() {
                return Some((Ok(event), (backlog, rx)));
            }
            loop {
                match rx.recv().await {
                    // Already delivered from the backlog.
                    Ok(event) if event.sequence <= replayed_upto && event.sequence > since => {}
                    Ok(event) => return Some((Ok(event), (backlog, rx))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "simulated event feed lagged, closing stream");
                        return None;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
