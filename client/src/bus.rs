//! Event bus.
//!
//! Tracks subscriptions per topic and fans published events out over
//! unbounded channels. Publishing never blocks and never runs subscriber
//! code, so listeners cannot reach back into engine state.

use dashmap::DashMap;
use encore_engine::{Clock, EngineEvent, Event, MetricsAccumulator, PerformanceMetrics, Topic};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receiver handed to a subscriber.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

#[derive(Debug)]
struct Subscription {
    topic: Topic,
    sender: mpsc::UnboundedSender<Event>,
}

/// Topic-based publish/subscribe.
#[derive(Debug, Default)]
pub struct EventBus {
    subscriptions: DashMap<String, Subscription>,
    /// Index of subscription ids by topic
    by_topic: DashMap<Topic, Vec<String>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one topic. Returns the subscription id and its receiver.
    pub fn subscribe(&self, topic: Topic) -> (String, EventReceiver) {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, rx) = mpsc::unbounded_channel();

        self.subscriptions
            .insert(id.clone(), Subscription { topic, sender });
        self.by_topic.entry(topic).or_default().push(id.clone());

        tracing::debug!(subscription = %id, %topic, "Subscribed");
        (id, rx)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let Some((_, subscription)) = self.subscriptions.remove(id) else {
            return false;
        };
        if let Some(mut ids) = self.by_topic.get_mut(&subscription.topic) {
            ids.retain(|s| s != id);
            if ids.is_empty() {
                drop(ids);
                self.by_topic.remove(&subscription.topic);
            }
        }
        true
    }

    /// Deliver `event` to every subscriber of its topic.
    ///
    /// Returns the number of receivers reached. Subscriptions whose
    /// receiver was dropped are removed.
    pub fn publish(&self, event: Event) -> usize {
        let ids = match self.by_topic.get(&event.topic) {
            Some(ids) => ids.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for id in ids {
            let sent = self
                .subscriptions
                .get(&id)
                .map(|s| s.sender.send(event.clone()).is_ok());
            match sent {
                Some(true) => delivered += 1,
                _ => closed.push(id),
            }
        }

        for id in closed {
            self.unsubscribe(&id);
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.by_topic.get(&topic).map_or(0, |ids| ids.len())
    }
}

/// Wraps payloads into [`Event`]s and publishes them.
///
/// Owns the running performance counters so every envelope carries a
/// current [`PerformanceMetrics`] snapshot.
pub struct Publisher {
    bus: EventBus,
    clock: Arc<dyn Clock>,
    stats: Mutex<MetricsAccumulator>,
    queue_depth: AtomicUsize,
}

impl Publisher {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            bus: EventBus::new(),
            clock,
            stats: Mutex::new(MetricsAccumulator::new()),
            queue_depth: AtomicUsize::new(0),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn emit(&self, payload: EngineEvent) -> usize {
        let event = Event::new(payload, self.clock.now_millis(), self.performance());
        self.bus.publish(event)
    }

    pub fn performance(&self) -> PerformanceMetrics {
        let depth = self.queue_depth.load(Ordering::SeqCst);
        self.stats.lock().snapshot(depth)
    }

    /// Counter access. Do not hold the guard across an await.
    pub fn stats(&self) -> MutexGuard<'_, MetricsAccumulator> {
        self.stats.lock()
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::SeqCst);
        crate::metrics::set_queue_depth(depth);
    }
}
