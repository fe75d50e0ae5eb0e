use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::limits::CHANGE_CHANNEL_CAPACITY;
use crate::model::ChangeEvent;

/// Broadcast hub for record-change notifications, one channel per hostel.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<ChangeEvent>>,
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

    /// Subscribe to changes in a hostel. Creates the channel if needed.
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self, hostel: &str) -> broadcast::Receiver<ChangeEvent> {
        let sender = self
            .channels
            .entry(hostel.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: ChangeEvent) {
        if let Some(sender) = self.channels.get(&event.hostel) {
            let _ = sender.send(event);
        }
    }

    pub fn subscriber_count(&self, hostel: &str) -> usize {
        self.channels
            .get(hostel)
            .map_or(0, |s| s.receiver_count())
    }
}
