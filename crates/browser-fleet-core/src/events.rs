//! Event bus: subscribe to pool, breaker, and proxy lifecycle events by kind.
//!
//! A bus is constructed once and shared via `Arc`. Subscribers register a
//! callback or take an unbounded channel; unsubscribing removes the entry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::types::{CircuitState, InstanceState, ScaleDirection};

/// Something that happened inside the fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    CircuitStateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },
    InstanceLaunched {
        instance_id: String,
    },
    InstanceStateChanged {
        instance_id: String,
        from: InstanceState,
        to: InstanceState,
    },
    InstanceClosed {
        instance_id: String,
        reason: String,
    },
    InstanceRecycled {
        instance_id: String,
        score: f64,
        reason: String,
    },
    ScalingDecision {
        direction: ScaleDirection,
        from: usize,
        to: usize,
        utilization: f64,
    },
    ProxyRotated {
        context_id: String,
        previous: Option<String>,
        current: String,
    },
    ProxyHealthChanged {
        proxy_id: String,
        healthy: bool,
        last_error: Option<String>,
    },
}

/// Discriminant used to subscribe to one family of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CircuitStateChanged,
    InstanceLaunched,
    InstanceStateChanged,
    InstanceClosed,
    InstanceRecycled,
    ScalingDecision,
    ProxyRotated,
    ProxyHealthChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::CircuitStateChanged,
        EventKind::InstanceLaunched,
        EventKind::InstanceStateChanged,
        EventKind::InstanceClosed,
        EventKind::InstanceRecycled,
        EventKind::ScalingDecision,
        EventKind::ProxyRotated,
        EventKind::ProxyHealthChanged,
    ];
}

impl FleetEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CircuitStateChanged { .. } => EventKind::CircuitStateChanged,
            Self::InstanceLaunched { .. } => EventKind::InstanceLaunched,
            Self::InstanceStateChanged { .. } => EventKind::InstanceStateChanged,
            Self::InstanceClosed { .. } => EventKind::InstanceClosed,
            Self::InstanceRecycled { .. } => EventKind::InstanceRecycled,
            Self::ScalingDecision { .. } => EventKind::ScalingDecision,
            Self::ProxyRotated { .. } => EventKind::ProxyRotated,
            Self::ProxyHealthChanged { .. } => EventKind::ProxyHealthChanged,
        }
    }
}

/// Callback invoked synchronously on emit. Keep it cheap.
pub type EventHandler = Arc<dyn Fn(&FleetEvent) + Send + Sync>;

/// Handle returned by `subscribe*`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

#[derive(Clone)]
enum Sink {
    Callback(EventHandler),
    Channel(mpsc::UnboundedSender<FleetEvent>),
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    sink: Sink,
}

/// Publish/subscribe registry keyed by [`EventKind`].
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&FleetEvent) + Send + Sync + 'static,
    {
        self.insert(kind, Sink::Callback(Arc::new(handler)))
    }

    /// Receive events of one kind on an unbounded channel.
    pub fn subscribe_channel(
        &self,
        kind: EventKind,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<FleetEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.insert(kind, Sink::Channel(tx)), rx)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() < before;
        }
        removed
    }

    /// Deliver an event to every subscriber of its kind, in registration order.
    pub fn emit(&self, event: FleetEvent) {
        let kind = event.kind();
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let targets: Vec<Subscriber> = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match subscribers.get(&kind) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        let mut closed = Vec::new();
        for subscriber in &targets {
            match &subscriber.sink {
                Sink::Callback(handler) => handler(&event),
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(subscriber.id);
                    }
                }
            }
        }
        trace!(?kind, delivered = targets.len() - closed.len(), "Event emitted");

        for id in closed {
            self.unsubscribe(id);
        }
    }

    /// Number of live subscriptions for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, |v| v.len())
    }

    fn insert(&self, kind: EventKind, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscriber { id, sink });
        id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn rotated(context: &str) -> FleetEvent {
        FleetEvent::ProxyRotated {
            context_id: context.into(),
            previous: Some("a".into()),
            current: "b".into(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.emit(rotated("ctx"));
        assert_eq!(bus.subscriber_count(EventKind::ProxyRotated), 0);
    }

    #[test]
    fn test_callbacks_fire_in_order_for_matching_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        bus.subscribe(EventKind::ProxyRotated, move |_| s1.lock().unwrap().push(1));
        let s2 = seen.clone();
        bus.subscribe(EventKind::ProxyRotated, move |_| s2.lock().unwrap().push(2));
        let s3 = seen.clone();
        bus.subscribe(EventKind::InstanceLaunched, move |_| {
            s3.lock().unwrap().push(3)
        });

        bus.emit(rotated("ctx"));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = bus.subscribe(EventKind::ProxyRotated, move |_| *c.lock().unwrap() += 1);

        bus.emit(rotated("ctx"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(rotated("ctx"));

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(EventKind::ProxyRotated), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription_receives_events() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe_channel(EventKind::ProxyRotated);
        bus.emit(rotated("ctx-1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event, rotated("ctx-1"));
    }

    #[test]
    fn test_dropped_channel_is_pruned() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe_channel(EventKind::ProxyRotated);
        drop(rx);
        assert_eq!(bus.subscriber_count(EventKind::ProxyRotated), 1);
        bus.emit(rotated("ctx"));
        assert_eq!(bus.subscriber_count(EventKind::ProxyRotated), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(rotated("ctx")).unwrap();
        assert_eq!(json["event"], "proxy_rotated");
        assert_eq!(json["context_id"], "ctx");
    }
}
