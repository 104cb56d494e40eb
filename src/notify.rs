use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::dispatch::{DeliveryError, Notification, NotificationSink};

const CHANNEL_CAPACITY: usize = 256;

/// In-process broadcast hub: one channel per room, created on first subscribe.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a room. Creates the channel if needed.
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        if let Some(sender) = self.channels.get(&notification.room_id()) {
            let _ = sender.send(notification.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for NotifyHub {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.send(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn entry(room_id: Ulid) -> WaitlistEntry {
        WaitlistEntry {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id,
            interval: Interval::new(HOUR_MS, 2 * HOUR_MS),
            status: WaitlistStatus::Expired,
            created_at: 0,
            seq: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let room = Ulid::new();
        let mut rx = hub.subscribe(room);

        let notification = Notification::WaitlistExpired { entry: entry(room) };
        hub.deliver(&notification).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, notification);
    }

    #[tokio::test]
    async fn other_rooms_are_not_received() {
        let hub = NotifyHub::new();
        let room = Ulid::new();
        let mut rx = hub.subscribe(room);

        hub.send(&Notification::WaitlistExpired { entry: entry(Ulid::new()) });
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Notification::WaitlistExpired { entry: entry(Ulid::new()) });
    }
}
