//! In-memory fan-out event bus (§4.11). A publish is (a) handed to every connected
//! subscriber's own bounded channel, non-blockingly, and (b) written to the event
//! store. A full subscriber channel drops the event for that subscriber only;
//! neither the other subscribers nor the event-store write are affected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::models::Event;
use crate::storage::Storage;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 2000;

pub struct EventBus {
    storage: Arc<Storage>,
    subscribers: RwLock<Vec<mpsc::Sender<Event>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(storage: Arc<Storage>) -> Self {
        EventBus {
            storage,
            subscribers: RwLock::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a new subscriber (e.g. one SSE connection) and returns its receiver.
    pub async fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Publishes an event to every live subscriber and persists it. The DB write is
    /// best-effort: a failure there must never prevent the SSE fan-out (§4.11).
    pub async fn publish(&self, event: Event) {
        {
            let mut subs = self.subscribers.write().await;
            subs.retain(|tx| !tx.is_closed());
            for tx in subs.iter() {
                if tx.try_send(event.clone()).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(event_type = %event.event_type, "event bus subscriber full, dropping event");
                }
            }
        }

        self.storage.record_event(&event).await;
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;

    async fn bus() -> (EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let storage = Storage::connect(path.to_str().unwrap()).await.unwrap();
        (EventBus::new(Arc::new(storage)), dir)
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let (bus, _dir) = bus().await;
        let mut rx = bus.subscribe().await;
        bus.publish(Event::new(EventType::WatchStarted, serde_json::json!({}))).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "watch_started");
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking_others() {
        let (bus, _dir) = bus().await;
        let mut slow_rx = bus.subscribe().await;
        let mut healthy_rx = bus.subscribe().await;

        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 10) {
            bus.publish(Event::new(EventType::ScanResult, serde_json::json!({}))).await;
        }

        assert!(bus.dropped_count() > 0);
        assert!(healthy_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_ok());
    }
}
