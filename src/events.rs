//! Connection lifecycle events for status broadcasting.
//!
//! The [`EventBus`] fans out to any number of subscribers, each behind its
//! own bounded queue. Publishing never blocks: a subscriber that has fallen
//! 50 events behind loses the new event (logged at warn) rather than
//! stalling the publisher.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

/// Queue depth per subscriber.
const SUBSCRIBER_BUFFER: usize = 50;

/// What happened to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    StateChanged,
    Connected,
    Disconnected,
    Error,
    Retrying,
    ServerAdded,
    ServerRemoved,
    ReconciliationComplete,
    ReconciliationFailed,
    OAuthRequired,
    OAuthCompleted,
}

/// A single lifecycle event.
///
/// Cheap to clone; `payload` carries freeform extras (tool counts, retry
/// attempt numbers) without growing the enum.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Server the event concerns; empty for cluster-wide events.
    pub server: String,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub payload: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, server: impl Into<String>) -> Self {
        Self {
            kind,
            server: server.into(),
            timestamp: Utc::now(),
            error: None,
            payload: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_payload(mut self, key: &str, value: impl Into<String>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Returns true if this event reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Error | EventKind::ReconciliationFailed
        )
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Fan-out event bus.
///
/// Clone-free sharing: hold it in an `Arc` and hand out references.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Receiving half handed to a subscriber.
pub struct EventReceiver {
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl EventReceiver {
    /// Identifier to pass to [`EventBus::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` once unsubscribed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Subscriber { id, tx });
        EventReceiver { id, rx }
    }

    /// Remove a subscriber; its channel closes once the queue drains.
    pub fn unsubscribe(&self, id: u64) {
        // Take the sender out under the lock, drop it after release.
        let removed = {
            let mut subs = self
                .subscribers
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            subs.iter()
                .position(|s| s.id == id)
                .map(|index| subs.swap_remove(index))
        };
        drop(removed);
    }

    /// Publish to every subscriber without blocking.
    ///
    /// A full queue drops the event for that subscriber only; a closed
    /// queue (receiver dropped) prunes the subscriber.
    pub fn publish(&self, event: Event) {
        let mut closed = Vec::new();
        {
            let subs = self
                .subscribers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for sub in subs.iter() {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subscriber = sub.id,
                            server = %event.server,
                            kind = ?event.kind,
                            "event subscriber queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(sub.id);
                    }
                }
            }
        }
        for id in closed {
            self.unsubscribe(id);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::new(EventKind::Connected, "holler").with_payload("tools", "5"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.server, "holler");
        assert_eq!(event.kind, EventKind::Connected);
        assert_eq!(event.payload.get("tools").map(String::as_str), Some("5"));
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::new(EventKind::ServerAdded, "s1"));

        assert_eq!(rx1.recv().await.unwrap().server, "s1");
        assert_eq!(rx2.recv().await.unwrap().server, "s1");
    }

    #[tokio::test]
    async fn test_per_subscriber_order_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::new(EventKind::ServerAdded, "s1"));
        bus.publish(Event::new(EventKind::Connected, "s1"));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::ServerAdded);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Connected);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..SUBSCRIBER_BUFFER + 10 {
            bus.publish(Event::new(EventKind::StateChanged, format!("s{i}")));
        }

        // Exactly the buffered prefix arrives; the overflow was dropped.
        let mut received = 0;
        while rx.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let mut rx2 = bus.subscribe();
        drop(rx);

        bus.publish(Event::new(EventKind::Disconnected, "s1"));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(rx2.recv().await.unwrap().server, "s1");
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.unsubscribe(rx.id());

        bus.publish(Event::new(EventKind::Connected, "s1"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_is_error() {
        assert!(Event::new(EventKind::Error, "s").is_error());
        assert!(Event::new(EventKind::ReconciliationFailed, "").is_error());
        assert!(!Event::new(EventKind::Connected, "s").is_error());
    }
}
