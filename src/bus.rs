//! Room-keyed event bus.
//!
//! Topic-per-room pub/sub used to fan streaming events out to WebSocket
//! sessions and the reducer's status mirrors. Delivery is best-effort
//! at-most-once per subscriber: publishing to an empty room drops the
//! event, and lagged receivers lose the overwritten slots. Clients
//! reconcile through `history:sync`, so losses are tolerable.

use crate::events::Envelope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const ROOM_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    rooms: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fire-and-forget publish. Events published before any subscription
    /// exist are dropped by design.
    pub fn publish(&self, room: &str, event: Envelope) {
        let sender = {
            let rooms = self.rooms.lock().unwrap();
            rooms.get(room).cloned()
        };
        if let Some(sender) = sender {
            // Err means no live receivers; the room will be pruned when the
            // last subscription drops.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to a room. Only events published after this call are
    /// delivered.
    pub fn subscribe(&self, room: &str) -> RoomSubscription {
        let mut rooms = self.rooms.lock().unwrap();
        let sender = rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0);
        RoomSubscription {
            room: room.to_string(),
            receiver: sender.subscribe(),
            bus: self.clone(),
        }
    }

    /// Number of live subscribers in a room.
    pub fn subscriber_count(&self, room: &str) -> usize {
        let rooms = self.rooms.lock().unwrap();
        rooms.get(room).map_or(0, broadcast::Sender::receiver_count)
    }

    fn prune(&self, room: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(sender) = rooms.get(room) {
            if sender.receiver_count() == 0 {
                rooms.remove(room);
            }
        }
    }
}

/// A live room membership. Dropping it leaves the room; empty rooms are
/// pruned from the registry.
pub struct RoomSubscription {
    room: String,
    receiver: broadcast::Receiver<Envelope>,
    bus: EventBus,
}

impl RoomSubscription {
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Next event, or `None` once the room is gone. Lagged slots are
    /// skipped silently (at-most-once delivery).
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(room = %self.room, skipped, "subscriber lagged, dropping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        // Receiver must be gone before pruning can observe count 0; swap in
        // a receiver from a throwaway channel.
        let (dummy_tx, dummy_rx) = broadcast::channel(1);
        drop(dummy_tx);
        let real = std::mem::replace(&mut self.receiver, dummy_rx);
        drop(real);
        self.bus.prune(&self.room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::task_room;
    use serde_json::json;

    fn ev(n: i64) -> Envelope {
        Envelope::new("test", json!({"n": n}))
    }

    #[tokio::test]
    async fn delivers_only_after_subscription() {
        let bus = EventBus::new();
        let room = task_room(1);

        bus.publish(&room, ev(1)); // dropped, no subscribers

        let mut sub = bus.subscribe(&room);
        bus.publish(&room, ev(2));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.data["n"], 2);
    }

    #[tokio::test]
    async fn fifo_per_publisher() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("task:9");
        for n in 0..5 {
            bus.publish("task:9", ev(n));
        }
        for n in 0..5 {
            assert_eq!(sub.recv().await.unwrap().data["n"], n);
        }
    }

    #[tokio::test]
    async fn multiple_rooms_are_independent() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("task:1");
        let mut b = bus.subscribe("task:2");

        bus.publish("task:1", ev(1));
        bus.publish("task:2", ev(2));

        assert_eq!(a.recv().await.unwrap().data["n"], 1);
        assert_eq!(b.recv().await.unwrap().data["n"], 2);
    }

    #[tokio::test]
    async fn empty_rooms_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe("task:1");
        assert_eq!(bus.subscriber_count("task:1"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("task:1"), 0);
        assert!(bus.rooms.lock().unwrap().is_empty());
    }
}
