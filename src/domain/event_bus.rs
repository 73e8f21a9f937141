//! Broadcast channel for change notifications.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel. Every state
//! mutation publishes a [`VmChange`] through the bus, and all WebSocket
//! connections subscribe to receive filtered notifications.

use tokio::sync::broadcast;

use super::VmChange;

/// Broadcast bus for [`VmChange`]s.
///
/// Backed by a `tokio::broadcast` channel with a configurable capacity
/// (default 10 000). When the ring buffer is full, the oldest notifications
/// are dropped for lagging receivers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VmChange>,
}

impl EventBus {
    /// Creates a new `EventBus` with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes a notification to all subscribers.
    ///
    /// Returns the number of receivers that received it. Without active
    /// receivers the notification is dropped.
    pub fn publish(&self, change: VmChange) -> usize {
        self.sender.send(change).unwrap_or(0)
    }

    /// Creates a new receiver that will receive all future notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VmChange> {
        self.sender.subscribe()
    }

    /// Returns the current number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::VmId;
    use chrono::Utc;

    fn make_change(vm: &str) -> VmChange {
        VmChange::Purged {
            vm_id: VmId::from(vm),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn publish_without_receivers_returns_zero() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(make_change("vm-1")), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives_change() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(make_change("vm-7")), 2);

        let Ok(c1) = rx1.recv().await else {
            panic!("rx1 failed");
        };
        let Ok(c2) = rx2.recv().await else {
            panic!("rx2 failed");
        };
        assert_eq!(c1.vm_id(), &VmId::from("vm-7"));
        assert_eq!(c1.vm_id(), c2.vm_id());
    }

    #[test]
    fn receiver_count_tracks_subscribers() {
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        assert_eq!(bus.receiver_count(), 1);
        drop(rx);
        assert_eq!(bus.receiver_count(), 0);
    }
}
