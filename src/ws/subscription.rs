//! Per-connection subscription manager.
//!
//! Tracks which VM ids a WebSocket client is subscribed to and
//! provides server-side notification filtering.

use std::collections::HashSet;

use crate::domain::VmId;

/// Wildcard id matching every VM.
pub const WILDCARD: &str = "*";

/// Manages the set of VM subscriptions for a single WebSocket connection.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    /// Subscribed VM ids. If `subscribe_all` is true, this set is ignored.
    vm_ids: HashSet<VmId>,
    /// Whether the client subscribes to all VMs (wildcard `"*"`).
    subscribe_all: bool,
}

impl SubscriptionManager {
    /// Creates a new empty subscription manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds ids to the subscription set; `"*"` enables the wildcard.
    /// Returns the explicit ids that were added.
    pub fn subscribe(&mut self, ids: &[String]) -> Vec<VmId> {
        let mut added = Vec::new();
        for id in ids {
            if id == WILDCARD {
                self.subscribe_all = true;
            } else {
                let vm_id = VmId::from(id.as_str());
                self.vm_ids.insert(vm_id.clone());
                added.push(vm_id);
            }
        }
        added
    }

    /// Removes ids from the subscription set; `"*"` disables the wildcard.
    /// Returns the explicit ids that were removed.
    pub fn unsubscribe(&mut self, ids: &[String]) -> Vec<VmId> {
        let mut removed = Vec::new();
        for id in ids {
            if id == WILDCARD {
                self.subscribe_all = false;
            } else {
                let vm_id = VmId::from(id.as_str());
                if self.vm_ids.remove(&vm_id) {
                    removed.push(vm_id);
                }
            }
        }
        removed
    }

    /// Returns `true` if notifications for `vm_id` pass the filter.
    #[must_use]
    pub fn matches(&self, vm_id: &VmId) -> bool {
        self.subscribe_all || self.vm_ids.contains(vm_id)
    }

    /// Returns the number of explicitly subscribed VM ids.
    #[must_use]
    pub fn count(&self) -> usize {
        self.vm_ids.len()
    }

    /// Returns `true` if the wildcard subscription is active.
    #[must_use]
    pub const fn is_subscribed_all(&self) -> bool {
        self.subscribe_all
    }
}
