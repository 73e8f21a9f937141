//! Per-VM snapshot tree storage with fine-grained locking.
//!
//! [`SnapshotRegistry`] keeps one [`SnapshotTree`] per VM in a `HashMap`
//! where each tree is individually protected by a [`tokio::sync::RwLock`].
//! Trees of different VMs are mutated concurrently; mutations of one tree
//! are serialized.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use super::{EventBus, SnapshotListing, SnapshotTree, VmChange, VmId};

/// Central store of all snapshot trees.
#[derive(Debug)]
pub struct SnapshotRegistry {
    trees: RwLock<HashMap<VmId, Arc<RwLock<SnapshotTree>>>>,
    event_bus: EventBus,
}

impl SnapshotRegistry {
    /// Creates an empty registry publishing to `event_bus`.
    #[must_use]
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
            event_bus,
        }
    }

    /// Returns the VM's tree, creating an empty one on first use.
    pub async fn get_or_create(&self, vm_id: &VmId) -> Arc<RwLock<SnapshotTree>> {
        if let Some(tree) = self.trees.read().await.get(vm_id) {
            return Arc::clone(tree);
        }
        let mut map = self.trees.write().await;
        Arc::clone(
            map.entry(vm_id.clone())
                .or_insert_with(|| Arc::new(RwLock::new(SnapshotTree::new(vm_id.clone())))),
        )
    }

    /// Returns the VM's tree if one exists.
    pub async fn get(&self, vm_id: &VmId) -> Option<Arc<RwLock<SnapshotTree>>> {
        self.trees.read().await.get(vm_id).map(Arc::clone)
    }

    /// Returns a copy of the VM's snapshots (empty if it has none).
    pub async fn listing(&self, vm_id: &VmId) -> SnapshotListing {
        match self.get(vm_id).await {
            Some(tree) => tree.read().await.listing(),
            None => SnapshotListing::default(),
        }
    }

    /// Installs `tree` as the VM's tree, replacing any previous one.
    pub async fn replace(&self, tree: SnapshotTree) {
        let handle = self.get_or_create(tree.vm_id()).await;
        self.publish(&tree);
        *handle.write().await = tree;
    }

    /// Drops the VM's tree (VM deleted).
    pub async fn remove(&self, vm_id: &VmId) -> bool {
        self.trees.write().await.remove(vm_id).is_some()
    }

    /// Publishes the tree's current shape (or its quarantine) on the bus.
    pub fn publish(&self, tree: &SnapshotTree) {
        let change = match tree.quarantine_reason() {
            Some(reason) => VmChange::SnapshotsQuarantined {
                vm_id: tree.vm_id().clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
            None => VmChange::SnapshotsChanged {
                vm_id: tree.vm_id().clone(),
                active: tree.active().cloned(),
                count: tree.len(),
                timestamp: Utc::now(),
            },
        };
        let _ = self.event_bus.publish(change);
    }

    /// Returns the number of VMs with a tree.
    pub async fn len(&self) -> usize {
        self.trees.read().await.len()
    }

    /// Returns `true` if no VM has a tree.
    pub async fn is_empty(&self) -> bool {
        self.trees.read().await.is_empty()
    }
}
