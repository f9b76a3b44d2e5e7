//! In-process fan-out bus from event producers to transport subscribers.
//!
//! Each subscriber owns a bounded queue of pre-serialized frames. Publishing
//! serializes the event once, snapshots the subscriber set under a read lock,
//! then sends without holding any lock. A subscriber whose queue is full is
//! evicted so one stalled client cannot hold back the rest.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{ConnectionStatus, Event, OutputLevel};

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// A serialized event frame, shared across subscriber queues.
pub type Frame = Arc<str>;

/// Handle returned to a new subscriber.
pub struct Subscription {
    pub client_id: String,
    pub rx: mpsc::Receiver<Frame>,
}

/// Fan-out hub for dashboard events.
pub struct EventHub {
    buffer: usize,
    subscribers: RwLock<HashMap<String, mpsc::Sender<Frame>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new subscriber and send it the connection welcome.
    ///
    /// The welcome goes only to the new client, not to the broadcast set.
    pub async fn subscribe(&self) -> Subscription {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer);

        let welcome =
            Event::connection(ConnectionStatus::Connected, Some(client_id.clone())).to_frame();
        // A fresh channel always has capacity for the welcome frame.
        let _ = tx.try_send(Frame::from(welcome));

        self.subscribers
            .write()
            .await
            .insert(client_id.clone(), tx);
        debug!("subscriber {} connected", client_id);

        Subscription { client_id, rx }
    }

    /// Remove a subscriber. Safe to call more than once.
    pub async fn unsubscribe(&self, client_id: &str) {
        if self.subscribers.write().await.remove(client_id).is_some() {
            debug!("subscriber {} disconnected", client_id);
        }
    }

    /// Number of live subscribers.
    pub async fn client_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Serialize an event once and deliver it to every live subscriber.
    ///
    /// Never blocks on a slow consumer: a subscriber with a full queue is
    /// evicted and its channel closed. Returns the number of deliveries.
    pub async fn publish(&self, event: &Event) -> usize {
        let frame = Frame::from(event.to_frame());
        let (delivered, overflowed) = self.publish_frame(frame).await;

        // Tell the surviving clients a slow one was dropped.
        if overflowed > 0 {
            let notice = Event::log(
                OutputLevel::Warning,
                format!("dropped {} slow subscriber(s)", overflowed),
                "hub",
            );
            self.publish_frame(Frame::from(notice.to_frame())).await;
        }
        delivered
    }

    /// Returns the delivery count and how many subscribers overflowed.
    async fn publish_frame(&self, frame: Frame) -> (usize, usize) {
        let snapshot: Vec<(String, mpsc::Sender<Frame>)> = {
            let subs = self.subscribers.read().await;
            subs.iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut overflowed = 0;
        let mut evict = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("evicting subscriber {}: outbound queue full", id);
                    overflowed += 1;
                    evict.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evict.push(id);
                }
            }
        }

        if !evict.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in evict {
                subs.remove(&id);
            }
        }
        (delivered, overflowed)
    }

    /// Drop every subscriber, closing their channels.
    pub async fn close(&self) {
        let mut subs = self.subscribers.write().await;
        let n = subs.len();
        subs.clear();
        if n > 0 {
            debug!("hub closed, dropped {} subscribers", n);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{OutputLevel, RunStatus};

    fn frame_type(frame: &Frame) -> String {
        let json: serde_json::Value = serde_json::from_str(frame).unwrap();
        json["type"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_welcome_goes_to_new_subscriber_only() {
        let hub = EventHub::default();
        let mut first = hub.subscribe().await;

        let welcome = first.rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&welcome).unwrap();
        assert_eq!(json["type"], "connection");
        assert_eq!(json["data"]["status"], "connected");
        assert_eq!(json["data"]["client_id"], first.client_id.as_str());

        // A second subscriber's welcome must not reach the first.
        let _second = hub.subscribe().await;
        assert!(first.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_in_order() {
        let hub = EventHub::default();
        let mut a = hub.subscribe().await;
        let mut b = hub.subscribe().await;
        a.rx.recv().await.unwrap(); // welcome
        b.rx.recv().await.unwrap();

        for i in 0..10 {
            hub.publish(&Event::output(
                OutputLevel::Info,
                format!("line {}", i),
                None,
            ))
            .await;
        }

        for sub in [&mut a, &mut b] {
            for i in 0..10 {
                let frame = sub.rx.recv().await.unwrap();
                let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(json["data"]["message"], format!("line {}", i));
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_evicted_others_unaffected() {
        let hub = EventHub::new(4);
        let mut fast = hub.subscribe().await;
        let slow = hub.subscribe().await; // never reads
        fast.rx.recv().await.unwrap();
        assert_eq!(hub.client_count().await, 2);

        let mut received = 0;
        let mut notices = 0;
        let mut count = |frame: &Frame| {
            if frame_type(frame) == "log" {
                notices += 1;
            } else {
                received += 1;
            }
        };
        for i in 0..50 {
            hub.publish(&Event::output(OutputLevel::Info, format!("{}", i), None))
                .await;
            // Drain fast so it is never the one that overflows.
            while let Ok(frame) = fast.rx.try_recv() {
                count(&frame);
            }
        }
        while let Ok(frame) = fast.rx.try_recv() {
            count(&frame);
        }

        // Slow had 4 slots (one taken by its welcome); it must be gone,
        // and the survivor was told exactly once.
        assert_eq!(hub.client_count().await, 1);
        assert_eq!(received, 50);
        assert_eq!(notices, 1);
        drop(slow);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = EventHub::default();
        let sub = hub.subscribe().await;
        assert_eq!(hub.client_count().await, 1);

        hub.unsubscribe(&sub.client_id).await;
        hub.unsubscribe(&sub.client_id).await;
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_ends_receivers() {
        let hub = EventHub::default();
        let mut sub = hub.subscribe().await;
        sub.rx.recv().await.unwrap();

        hub.close().await;
        assert!(sub.rx.recv().await.is_none());
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_after_disconnect_does_not_fail() {
        let hub = EventHub::default();
        let sub = hub.subscribe().await;
        drop(sub.rx);

        let delivered = hub
            .publish(&Event::pipeline_status("p", RunStatus::Running, None, None))
            .await;
        assert_eq!(delivered, 0);
        // Closed channel cleaned up on publish.
        assert_eq!(hub.client_count().await, 0);
    }
}
