use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-spot broadcast hub. The booking dispatcher (confirmations,
/// cancellations, expiries) subscribes here; sends are fire-and-forget
/// so a slow or absent listener never fails the mutation that produced
/// the event.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a spot. Creates the channel if needed.
    pub fn subscribe(&self, spot_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(spot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, spot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&spot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a spot is deactivated for good).
    #[allow(dead_code)]
    pub fn remove(&self, spot_id: &Ulid) {
        self.channels.remove(spot_id);
    }
}
