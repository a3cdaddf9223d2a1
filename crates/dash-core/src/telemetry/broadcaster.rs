//! Subscriber registry and non-blocking fan-out
//!
//! Every subscriber owns a bounded channel. Publishing never waits: a full
//! channel loses that one event, a closed channel is deregistered.

use crate::models::{AlertEvent, Sample};
use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Default per-subscriber queue depth
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

/// Notification pushed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Update(Arc<Sample>),
    Alert(AlertEvent),
}

impl TelemetryEvent {
    /// Event name on the streaming transport
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::Update(_) => "update",
            TelemetryEvent::Alert(_) => "alert",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            TelemetryEvent::Update(sample) => serde_json::to_string(sample.as_ref()),
            TelemetryEvent::Alert(alert) => serde_json::to_string(alert),
        }
    }
}

/// Result of one publish call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    /// Subscribers whose queue was full
    pub dropped: usize,
    /// Subscribers found disconnected and removed
    pub removed: usize,
}

struct Registry {
    subscribers: DashMap<u64, mpsc::Sender<TelemetryEvent>>,
    next_id: AtomicU64,
    buffer: usize,
}

/// Fan-out hub shared by the cache and the transport layer
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.registry.buffer);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.subscribers.insert(id, tx);
        debug!(subscriber = id, total = self.subscriber_count(), "Subscriber registered");

        Subscription {
            id,
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deregister a subscriber by id; returns whether it was registered
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.registry.subscribers.remove(&id).is_some();
        if removed {
            debug!(subscriber = id, total = self.subscriber_count(), "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.len()
    }

    /// Push an event to every subscriber without blocking
    pub fn publish(&self, event: TelemetryEvent) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();
        let mut closed = Vec::new();

        for entry in self.registry.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    debug!(subscriber = *entry.key(), event = event.name(), "Subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // Removal happens after iteration; DashMap shards are locked while iterating
        for id in closed {
            if self.registry.subscribers.remove(&id).is_some() {
                outcome.removed += 1;
            }
        }

        outcome
    }
}

/// Receiving end of a subscription; deregisters itself when dropped
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<TelemetryEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TelemetryEvent> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly deregister
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribers.remove(&self.id);
            debug!(subscriber = self.id, "Subscription dropped");
        }
    }
}

impl Stream for Subscription {
    type Item = TelemetryEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertLevel, AlertType};

    fn alert(ts: i64) -> TelemetryEvent {
        TelemetryEvent::Alert(AlertEvent {
            id: "cpu:warning".to_string(),
            alert_type: AlertType::Cpu,
            level: AlertLevel::Warning,
            value: 90.0,
            threshold: 85.0,
            timestamp: ts,
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let hub = Broadcaster::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        let outcome = hub.publish(alert(1));
        assert_eq!(outcome.delivered, 2);

        assert_eq!(a.recv().await, Some(alert(1)));
        assert_eq!(b.recv().await, Some(alert(1)));
    }

    #[test]
    fn test_drop_deregisters() {
        let hub = Broadcaster::default();
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(a);
        assert_eq!(hub.subscriber_count(), 1);

        b.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_by_id() {
        let hub = Broadcaster::default();
        let sub = hub.subscribe();
        assert!(hub.unsubscribe(sub.id()));
        assert!(!hub.unsubscribe(sub.id()));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_slow_subscriber_does_not_affect_others() {
        let hub = Broadcaster::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for ts in 0..2 {
            hub.publish(alert(ts));
            assert!(fast.try_recv().is_some());
        }

        // `slow` is now full
        let outcome = hub.publish(alert(2));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(fast.try_recv(), Some(alert(2)));

        // Slow subscriber keeps what fit and stays registered
        assert_eq!(slow.try_recv(), Some(alert(0)));
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[test]
    fn test_closed_receiver_is_removed_on_publish() {
        let hub = Broadcaster::default();
        let _live = hub.subscribe();

        // A sender whose receiver went away without deregistering
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        hub.registry.subscribers.insert(99, tx);
        assert_eq!(hub.subscriber_count(), 2);

        let outcome = hub.publish(alert(0));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.removed, 1);
        assert!(!hub.unsubscribe(99));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(alert(0).name(), "alert");
        assert!(alert(0).to_json().unwrap().contains("\"type\":\"cpu\""));
    }
}
