//! Per-VM snapshot forest with an active-snapshot pointer.
//!
//! A [`SnapshotTree`] exclusively owns the [`SnapshotNode`]s of one VM. The
//! structure is a forest: nodes with no parent are roots, every other node's
//! parent lives in the same tree, and parent chains never loop. The active
//! pointer names the node the VM is currently running from (or nothing when
//! the VM runs from its no-snapshot baseline).
//!
//! Every mutation re-checks those invariants. A violation is a logic fault:
//! the tree is quarantined (all further mutations refuse with
//! [`OrchestratorError::InvariantViolation`]) until reconciliation rebuilds it
//! from the control plane's listing. It is never repaired in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{PowerState, Resources, SnapshotId, VmId};
use crate::error::OrchestratorError;

/// One captured VM state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SnapshotNode {
    /// Snapshot identifier (control-plane assigned).
    pub id: SnapshotId,
    /// Parent snapshot; `None` for a root.
    pub parent: Option<SnapshotId>,
    /// Owning VM.
    pub vm_id: VmId,
    /// Snapshot name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Power state recorded at capture time (`Off` or `On`).
    pub power_state: PowerState,
    /// CPU / memory allocation recorded at capture time.
    pub resources: Resources,
}

/// Fields of a snapshot about to be appended under the active pointer.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    /// Identifier assigned by the control plane.
    pub id: SnapshotId,
    /// Snapshot name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Power state of the VM when captured.
    pub power_state: PowerState,
    /// Resource allocation of the VM when captured.
    pub resources: Resources,
}

/// Authoritative snapshot listing of one VM, as returned by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SnapshotListing {
    /// All snapshot nodes of the VM.
    pub nodes: Vec<SnapshotNode>,
    /// Node the VM currently runs from.
    pub active: Option<SnapshotId>,
}

/// Request to realise a new VM whose baseline equals a snapshot.
///
/// Produced by [`SnapshotTree::clone_from`]; the orchestrator turns it into a
/// control-plane clone call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCloneRequest {
    /// VM owning the snapshot.
    pub source_vm: VmId,
    /// Snapshot to clone.
    pub snapshot_id: SnapshotId,
    /// Power state recorded in the snapshot.
    pub baseline_power: PowerState,
    /// Resource allocation recorded in the snapshot.
    pub baseline_resources: Resources,
}

/// Difference between a VM's current allocation and a snapshot's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ConfigComparison {
    /// Compared snapshot.
    pub snapshot_id: SnapshotId,
    /// Current allocation of the VM.
    pub current: Resources,
    /// Allocation recorded in the snapshot.
    pub snapshot: Resources,
    /// `current.vcpus - snapshot.vcpus`.
    pub vcpu_delta: i64,
    /// `current.memory_mib - snapshot.memory_mib`.
    pub memory_delta_mib: i64,
}

impl ConfigComparison {
    /// Returns `true` when the allocations match.
    #[must_use]
    pub const fn is_identical(&self) -> bool {
        self.vcpu_delta == 0 && self.memory_delta_mib == 0
    }
}

/// Snapshot forest of a single VM.
#[derive(Debug, Clone)]
pub struct SnapshotTree {
    vm_id: VmId,
    nodes: BTreeMap<SnapshotId, SnapshotNode>,
    active: Option<SnapshotId>,
    quarantine: Option<String>,
}

impl SnapshotTree {
    /// Creates an empty tree (VM running from its baseline).
    #[must_use]
    pub fn new(vm_id: VmId) -> Self {
        Self {
            vm_id,
            nodes: BTreeMap::new(),
            active: None,
            quarantine: None,
        }
    }

    /// Rebuilds a tree from an authoritative listing.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvariantViolation`] if the listing does
    /// not describe a valid forest for `vm_id`.
    pub fn from_listing(vm_id: VmId, listing: SnapshotListing) -> Result<Self, OrchestratorError> {
        let mut tree = Self::new(vm_id.clone());
        for node in listing.nodes {
            if tree.nodes.insert(node.id.clone(), node).is_some() {
                return Err(OrchestratorError::InvariantViolation {
                    vm_id,
                    detail: "listing contains a duplicate snapshot id".to_string(),
                });
            }
        }
        tree.active = listing.active;
        tree.check_invariants()
            .map_err(|detail| OrchestratorError::InvariantViolation { vm_id, detail })?;
        Ok(tree)
    }

    /// Owning VM.
    #[must_use]
    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }

    /// Active snapshot pointer.
    #[must_use]
    pub fn active(&self) -> Option<&SnapshotId> {
        self.active.as_ref()
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: &SnapshotId) -> Option<&SnapshotNode> {
        self.nodes.get(id)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the tree has no snapshots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &SnapshotNode> {
        self.nodes.values()
    }

    /// Nodes without a parent.
    #[must_use]
    pub fn roots(&self) -> Vec<&SnapshotNode> {
        self.nodes.values().filter(|n| n.parent.is_none()).collect()
    }

    /// Direct children of `id`.
    #[must_use]
    pub fn children(&self, id: &SnapshotId) -> Vec<&SnapshotNode> {
        self.nodes
            .values()
            .filter(|n| n.parent.as_ref() == Some(id))
            .collect()
    }

    /// Parent chain of `id`, starting with `id` itself and ending at its root.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::SnapshotNotFound`] if `id` is absent.
    pub fn ancestry(&self, id: &SnapshotId) -> Result<Vec<SnapshotId>, OrchestratorError> {
        let mut chain = Vec::new();
        let mut cursor = Some(self.require(id)?);
        while let Some(node) = cursor {
            chain.push(node.id.clone());
            if chain.len() > self.nodes.len() {
                break;
            }
            cursor = node.parent.as_ref().and_then(|p| self.nodes.get(p));
        }
        Ok(chain)
    }

    /// Snapshot view for listings and reconciliation.
    #[must_use]
    pub fn listing(&self) -> SnapshotListing {
        SnapshotListing {
            nodes: self.nodes.values().cloned().collect(),
            active: self.active.clone(),
        }
    }

    /// Returns `true` once an invariant violation has frozen the tree.
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }

    /// Why the tree was quarantined.
    #[must_use]
    pub fn quarantine_reason(&self) -> Option<&str> {
        self.quarantine.as_deref()
    }

    /// Fails if the tree is quarantined.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvariantViolation`] carrying the recorded
    /// quarantine reason.
    pub fn ensure_usable(&self) -> Result<(), OrchestratorError> {
        match &self.quarantine {
            Some(reason) => Err(OrchestratorError::InvariantViolation {
                vm_id: self.vm_id.clone(),
                detail: format!("tree quarantined: {reason}"),
            }),
            None => Ok(()),
        }
    }

    /// Appends a snapshot under the active pointer and makes it active.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::InvariantViolation`] if the tree is quarantined
    ///   or the mutation breaks an invariant.
    /// - [`OrchestratorError::InvalidRequest`] if the id is already used or
    ///   the recorded power state is neither `Off` nor `On`.
    pub fn create(&mut self, new: NewSnapshot) -> Result<&SnapshotNode, OrchestratorError> {
        self.ensure_usable()?;
        if self.nodes.contains_key(&new.id) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "snapshot {} already exists for {}",
                new.id, self.vm_id
            )));
        }
        if !matches!(new.power_state, PowerState::Off | PowerState::On) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "snapshot must record off or on, got {}",
                new.power_state
            )));
        }

        let id = new.id.clone();
        let node = SnapshotNode {
            id: new.id,
            parent: self.active.clone(),
            vm_id: self.vm_id.clone(),
            name: new.name,
            description: new.description,
            created_at: new.created_at,
            power_state: new.power_state,
            resources: new.resources,
        };
        self.nodes.insert(id.clone(), node);
        self.active = Some(id.clone());
        self.verify()?;
        self.require(&id)
    }

    /// Removes a node, reparenting its children to the node's parent.
    ///
    /// If the removed node was active, the active pointer moves to its
    /// parent. Removing a root promotes its children to roots.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::SnapshotNotFound`] if `id` is absent.
    /// - [`OrchestratorError::InvariantViolation`] if the tree is quarantined
    ///   or the mutation breaks an invariant.
    pub fn delete(&mut self, id: &SnapshotId) -> Result<SnapshotNode, OrchestratorError> {
        self.ensure_usable()?;
        self.require(id)?;
        let removed = self.detach(id).ok_or_else(|| self.not_found(id))?;
        self.verify()?;
        Ok(removed)
    }

    /// Points the active pointer at `id` without structural change.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::SnapshotNotFound`] if `id` is absent.
    /// - [`OrchestratorError::InvariantViolation`] if the tree is quarantined.
    pub fn revert(&mut self, id: &SnapshotId) -> Result<&SnapshotNode, OrchestratorError> {
        self.ensure_usable()?;
        self.require(id)?;
        self.active = Some(id.clone());
        self.verify()?;
        self.require(id)
    }

    /// Describes a new VM whose baseline equals snapshot `id`.
    ///
    /// Does not create anything.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::SnapshotNotFound`] if `id` is absent.
    /// - [`OrchestratorError::InvariantViolation`] if the tree is quarantined.
    pub fn clone_from(&self, id: &SnapshotId) -> Result<SnapshotCloneRequest, OrchestratorError> {
        self.ensure_usable()?;
        let node = self.require(id)?;
        Ok(SnapshotCloneRequest {
            source_vm: self.vm_id.clone(),
            snapshot_id: node.id.clone(),
            baseline_power: node.power_state,
            baseline_resources: node.resources,
        })
    }

    /// Compares `current` against the allocation recorded in snapshot `id`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::SnapshotNotFound`] if `id` is absent.
    pub fn compare(
        &self,
        id: &SnapshotId,
        current: Resources,
    ) -> Result<ConfigComparison, OrchestratorError> {
        let node = self.require(id)?;
        Ok(ConfigComparison {
            snapshot_id: node.id.clone(),
            current,
            snapshot: node.resources,
            vcpu_delta: i64::from(current.vcpus) - i64::from(node.resources.vcpus),
            memory_delta_mib: i64::try_from(current.memory_mib).unwrap_or(i64::MAX)
                - i64::try_from(node.resources.memory_mib).unwrap_or(i64::MAX),
        })
    }

    /// Applies a control-plane-confirmed snapshot creation.
    ///
    /// Idempotent: returns `Ok(false)` if the node is already present. A
    /// parent unknown to this tree is promoted to a root rather than left
    /// dangling. The new node becomes active.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvariantViolation`] if the tree is
    /// quarantined or the insertion breaks an invariant.
    pub fn ingest_created(&mut self, mut node: SnapshotNode) -> Result<bool, OrchestratorError> {
        self.ensure_usable()?;
        if self.nodes.contains_key(&node.id) {
            return Ok(false);
        }
        if let Some(parent) = &node.parent
            && !self.nodes.contains_key(parent)
        {
            tracing::warn!(
                vm_id = %self.vm_id,
                snapshot_id = %node.id,
                parent = %parent,
                "snapshot parent unknown, promoting to root"
            );
            node.parent = None;
        }
        node.vm_id = self.vm_id.clone();
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        self.active = Some(id);
        self.verify()?;
        Ok(true)
    }

    /// Applies a control-plane-confirmed snapshot removal. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvariantViolation`] if the tree is
    /// quarantined or the removal breaks an invariant.
    pub fn ingest_removed(&mut self, id: &SnapshotId) -> Result<bool, OrchestratorError> {
        self.ensure_usable()?;
        if self.detach(id).is_none() {
            return Ok(false);
        }
        self.verify()?;
        Ok(true)
    }

    /// Applies a control-plane-confirmed revert. Unknown targets are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvariantViolation`] if the tree is
    /// quarantined.
    pub fn ingest_reverted(&mut self, id: &SnapshotId) -> Result<bool, OrchestratorError> {
        self.ensure_usable()?;
        if !self.nodes.contains_key(id) || self.active.as_ref() == Some(id) {
            return Ok(false);
        }
        self.active = Some(id.clone());
        self.verify()?;
        Ok(true)
    }

    /// Checks the structural invariants, returning a description of the
    /// first violation found.
    ///
    /// # Errors
    ///
    /// Returns the violation description.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(active) = &self.active
            && !self.nodes.contains_key(active)
        {
            return Err(format!("active pointer references missing snapshot {active}"));
        }
        for (key, node) in &self.nodes {
            if key != &node.id {
                return Err(format!("snapshot {} stored under key {key}", node.id));
            }
            if node.vm_id != self.vm_id {
                return Err(format!("snapshot {} owned by {}", node.id, node.vm_id));
            }
            if let Some(parent) = &node.parent
                && !self.nodes.contains_key(parent)
            {
                return Err(format!("snapshot {} has dangling parent {parent}", node.id));
            }
            // A chain longer than the node count must revisit a node.
            let mut steps = 0usize;
            let mut cursor = node.parent.as_ref();
            while let Some(parent) = cursor {
                steps += 1;
                if steps > self.nodes.len() {
                    return Err(format!("cycle through snapshot {}", node.id));
                }
                cursor = self.nodes.get(parent).and_then(|p| p.parent.as_ref());
            }
        }
        Ok(())
    }

    /// Removes `id` and reparents its children. Returns `None` if absent.
    fn detach(&mut self, id: &SnapshotId) -> Option<SnapshotNode> {
        let removed = self.nodes.remove(id)?;
        for node in self.nodes.values_mut() {
            if node.parent.as_ref() == Some(id) {
                node.parent.clone_from(&removed.parent);
            }
        }
        if self.active.as_ref() == Some(id) {
            self.active.clone_from(&removed.parent);
        }
        Some(removed)
    }

    /// Runs the invariant check after a mutation and quarantines on failure.
    fn verify(&mut self) -> Result<(), OrchestratorError> {
        if let Err(detail) = self.check_invariants() {
            tracing::error!(vm_id = %self.vm_id, %detail, "snapshot tree invariant violated, quarantining");
            self.quarantine = Some(detail.clone());
            return Err(OrchestratorError::InvariantViolation {
                vm_id: self.vm_id.clone(),
                detail,
            });
        }
        Ok(())
    }

    fn require(&self, id: &SnapshotId) -> Result<&SnapshotNode, OrchestratorError> {
        self.nodes.get(id).ok_or_else(|| self.not_found(id))
    }

    fn not_found(&self, id: &SnapshotId) -> OrchestratorError {
        OrchestratorError::SnapshotNotFound {
            vm_id: self.vm_id.clone(),
            snapshot_id: id.clone(),
            last_known: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const RES: Resources = Resources {
        vcpus: 1,
        memory_mib: 128,
    };

    fn snap(id: &str, power: PowerState) -> NewSnapshot {
        NewSnapshot {
            id: SnapshotId::from(id),
            name: id.to_uppercase(),
            description: format!("{id} by test"),
            created_at: Utc::now(),
            power_state: power,
            resources: RES,
        }
    }

    fn tree() -> SnapshotTree {
        SnapshotTree::new(VmId::from("vm-1"))
    }

    fn parent_of(tree: &SnapshotTree, id: &str) -> Option<SnapshotId> {
        let Some(node) = tree.get(&SnapshotId::from(id)) else {
            panic!("missing node {id}");
        };
        node.parent.clone()
    }

    #[test]
    fn create_chains_under_active() {
        let mut t = tree();
        assert!(t.create(snap("a", PowerState::On)).is_ok());
        assert!(t.create(snap("b", PowerState::On)).is_ok());

        assert_eq!(parent_of(&t, "a"), None);
        assert_eq!(parent_of(&t, "b"), Some(SnapshotId::from("a")));
        assert_eq!(t.active(), Some(&SnapshotId::from("b")));
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let mut t = tree();
        assert!(t.create(snap("a", PowerState::Off)).is_ok());
        let err = t.create(snap("a", PowerState::Off));
        assert!(matches!(err, Err(OrchestratorError::InvalidRequest(_))));
        assert!(!t.is_quarantined());
    }

    #[test]
    fn create_rejects_transient_power_state() {
        let mut t = tree();
        let err = t.create(snap("a", PowerState::PoweringOn));
        assert!(matches!(err, Err(OrchestratorError::InvalidRequest(_))));
        assert!(t.is_empty());
    }

    #[test]
    fn delete_internal_reparents_children_and_moves_active() {
        // root -> a -> b, with active = a after reverting to it.
        let mut t = tree();
        assert!(t.create(snap("root", PowerState::Off)).is_ok());
        assert!(t.create(snap("a", PowerState::On)).is_ok());
        assert!(t.create(snap("b", PowerState::On)).is_ok());
        assert!(t.revert(&SnapshotId::from("a")).is_ok());

        let removed = t.delete(&SnapshotId::from("a"));
        assert!(removed.is_ok());

        assert_eq!(parent_of(&t, "b"), Some(SnapshotId::from("root")));
        assert_eq!(t.active(), Some(&SnapshotId::from("root")));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn delete_root_promotes_children() {
        let mut t = tree();
        assert!(t.create(snap("a", PowerState::Off)).is_ok());
        assert!(t.create(snap("b", PowerState::Off)).is_ok());
        assert!(t.revert(&SnapshotId::from("a")).is_ok());
        assert!(t.create(snap("c", PowerState::Off)).is_ok());

        assert!(t.delete(&SnapshotId::from("a")).is_ok());
        let roots: Vec<_> = t.roots().iter().map(|n| n.id.clone()).collect();
        assert_eq!(roots, vec![SnapshotId::from("b"), SnapshotId::from("c")]);
        assert_eq!(t.active(), Some(&SnapshotId::from("c")));
    }

    #[test]
    fn delete_active_root_clears_pointer() {
        let mut t = tree();
        assert!(t.create(snap("a", PowerState::Off)).is_ok());
        assert!(t.delete(&SnapshotId::from("a")).is_ok());
        assert_eq!(t.active(), None);
        assert!(t.is_empty());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let mut t = tree();
        let err = t.delete(&SnapshotId::from("ghost"));
        assert!(matches!(err, Err(OrchestratorError::SnapshotNotFound { .. })));
    }

    #[test]
    fn revert_missing_is_not_found() {
        let mut t = tree();
        let err = t.revert(&SnapshotId::from("ghost"));
        assert!(matches!(err, Err(OrchestratorError::SnapshotNotFound { .. })));
    }

    #[test]
    fn revert_keeps_structure() {
        let mut t = tree();
        assert!(t.create(snap("a", PowerState::Off)).is_ok());
        assert!(t.create(snap("b", PowerState::On)).is_ok());
        let before = t.listing().nodes;
        assert!(t.revert(&SnapshotId::from("a")).is_ok());
        assert_eq!(t.listing().nodes, before);
        assert_eq!(t.active(), Some(&SnapshotId::from("a")));

        // Branching after a revert hangs the new node off the reverted one.
        assert!(t.create(snap("c", PowerState::On)).is_ok());
        assert_eq!(parent_of(&t, "c"), Some(SnapshotId::from("a")));
        assert_eq!(t.children(&SnapshotId::from("a")).len(), 2);
    }

    #[test]
    fn clone_from_carries_recorded_baseline() {
        let mut t = tree();
        assert!(t.create(snap("a", PowerState::Off)).is_ok());
        let Ok(req) = t.clone_from(&SnapshotId::from("a")) else {
            panic!("clone request failed");
        };
        assert_eq!(req.source_vm, VmId::from("vm-1"));
        assert_eq!(req.baseline_power, PowerState::Off);
        assert_eq!(req.baseline_resources, RES);
    }

    #[test]
    fn compare_reports_deltas() {
        let mut t = tree();
        assert!(t.create(snap("a", PowerState::Off)).is_ok());
        let current = Resources {
            vcpus: 2,
            memory_mib: 256,
        };
        let Ok(cmp) = t.compare(&SnapshotId::from("a"), current) else {
            panic!("compare failed");
        };
        assert_eq!(cmp.vcpu_delta, 1);
        assert_eq!(cmp.memory_delta_mib, 128);
        assert!(!cmp.is_identical());
    }

    #[test]
    fn ancestry_walks_to_root() {
        let mut t = tree();
        for id in ["a", "b", "c"] {
            assert!(t.create(snap(id, PowerState::On)).is_ok());
        }
        let Ok(chain) = t.ancestry(&SnapshotId::from("c")) else {
            panic!("ancestry failed");
        };
        let chain: Vec<_> = chain.iter().map(SnapshotId::as_str).collect();
        assert_eq!(chain, vec!["c", "b", "a"]);
    }

    #[test]
    fn random_create_delete_sequences_keep_forest_acyclic() {
        let mut t = tree();
        let mut seed: u64 = 0x5eed;
        let mut next = || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            seed >> 33
        };
        for i in 0..400 {
            let ids: Vec<SnapshotId> = t.nodes().map(|n| n.id.clone()).collect();
            match next() % 4 {
                0 | 1 => {
                    let _ = t.create(snap(&format!("s{i}"), PowerState::On));
                }
                2 if !ids.is_empty() => {
                    let victim = &ids[(next() as usize) % ids.len()];
                    assert!(t.delete(victim).is_ok());
                }
                _ if !ids.is_empty() => {
                    let target = &ids[(next() as usize) % ids.len()];
                    assert!(t.revert(target).is_ok());
                }
                _ => {}
            }
            assert!(t.check_invariants().is_ok());
            for node in t.nodes() {
                let Ok(chain) = t.ancestry(&node.id) else {
                    panic!("ancestry failed");
                };
                let Some(last) = chain.last().and_then(|id| t.get(id)) else {
                    panic!("empty chain");
                };
                assert!(last.parent.is_none(), "chain of {} ends off-root", node.id);
            }
        }
        assert!(!t.is_quarantined());
    }

    #[test]
    fn corruption_quarantines_tree() {
        let mut t = tree();
        assert!(t.create(snap("a", PowerState::On)).is_ok());
        assert!(t.create(snap("b", PowerState::On)).is_ok());
        // Forge a cycle a <-> b behind the API's back.
        if let Some(a) = t.nodes.get_mut(&SnapshotId::from("a")) {
            a.parent = Some(SnapshotId::from("b"));
        }

        let err = t.revert(&SnapshotId::from("a"));
        assert!(matches!(err, Err(OrchestratorError::InvariantViolation { .. })));
        assert!(t.is_quarantined());

        // Further mutations refuse; nothing is silently repaired.
        let err = t.create(snap("c", PowerState::On));
        assert!(matches!(err, Err(OrchestratorError::InvariantViolation { .. })));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn from_listing_rejects_dangling_parent() {
        let node = SnapshotNode {
            id: SnapshotId::from("a"),
            parent: Some(SnapshotId::from("gone")),
            vm_id: VmId::from("vm-1"),
            name: "A".to_string(),
            description: String::new(),
            created_at: Utc::now(),
            power_state: PowerState::Off,
            resources: RES,
        };
        let listing = SnapshotListing {
            nodes: vec![node],
            active: None,
        };
        let err = SnapshotTree::from_listing(VmId::from("vm-1"), listing);
        assert!(matches!(err, Err(OrchestratorError::InvariantViolation { .. })));
    }

    #[test]
    fn ingest_is_idempotent_and_promotes_orphans() {
        let mut t = tree();
        let node = SnapshotNode {
            id: SnapshotId::from("x"),
            parent: Some(SnapshotId::from("unknown")),
            vm_id: VmId::from("vm-1"),
            name: "X".to_string(),
            description: String::new(),
            created_at: Utc::now(),
            power_state: PowerState::On,
            resources: RES,
        };
        assert!(matches!(t.ingest_created(node.clone()), Ok(true)));
        assert!(matches!(t.ingest_created(node), Ok(false)));
        assert_eq!(parent_of(&t, "x"), None);

        assert!(matches!(t.ingest_removed(&SnapshotId::from("x")), Ok(true)));
        assert!(matches!(t.ingest_removed(&SnapshotId::from("x")), Ok(false)));
        assert_eq!(t.active(), None);
    }
}
