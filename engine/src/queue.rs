//! In-memory offline mutation queue.
//!
//! The queue is the authoritative in-process view of pending work. It keeps
//! items sorted by priority (highest first), then by enqueue time, then by
//! insertion sequence, so iteration order is processing order. Durability is
//! the caller's job: the runtime persists an item before inserting it here.

use crate::{ItemId, QueueItem, Timestamp};
use std::collections::HashSet;

/// Priority ordered list of pending items.
#[derive(Debug, Clone, Default)]
pub struct OfflineQueue {
    items: Vec<QueueItem>,
    parked: HashSet<ItemId>,
}

impl OfflineQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted items, e.g. after a restart.
    pub fn restore(items: impl IntoIterator<Item = QueueItem>) -> Self {
        let mut queue = Self::new();
        for item in items {
            queue.insert(item);
        }
        queue
    }

    /// Insert an item at its priority position.
    ///
    /// An item with an id already present replaces the old entry.
    pub fn insert(&mut self, item: QueueItem) {
        self.items.retain(|existing| existing.id != item.id);
        let index = self
            .items
            .partition_point(|existing| existing.queue_order(&item).is_lt());
        self.items.insert(index, item);
    }

    /// All items in processing order.
    pub fn peek_ordered(&self) -> &[QueueItem] {
        &self.items
    }

    /// The next item that may be attempted at `now`.
    ///
    /// An item is ready when it is due, not parked, not behind an earlier
    /// enqueued item for the same entity, and none of its dependencies is
    /// still queued. `eligible` narrows the candidates further (a sync pass
    /// uses it to stay within the set of items it started with). Does not
    /// mutate the queue.
    pub fn next_ready<F>(&self, now: Timestamp, eligible: F) -> Option<&QueueItem>
    where
        F: Fn(&QueueItem) -> bool,
    {
        self.items
            .iter()
            .find(|item| eligible(item) && self.is_ready(item, now))
    }

    fn is_ready(&self, item: &QueueItem, now: Timestamp) -> bool {
        item.is_due(now)
            && !self.parked.contains(&item.id)
            && !self.blocked_by_entity(item)
            && !item.dependencies.iter().any(|dep| self.contains(dep))
    }

    /// Whether an earlier enqueued item for the same entity is still queued.
    pub fn blocked_by_entity(&self, item: &QueueItem) -> bool {
        let Some(key) = item.entity_key.as_ref() else {
            return false;
        };
        self.items.iter().any(|other| {
            other.id != item.id
                && other.entity_key.as_ref() == Some(key)
                && other.enqueued_before(item)
        })
    }

    /// Get an item by id.
    pub fn get(&self, id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Get a mutable item by id.
    ///
    /// Changing `priority`, `enqueued_at` or `seq` through this reference
    /// breaks ordering; use [`OfflineQueue::insert`] to reposition instead.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    /// Check if an item is queued.
    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id == id)
    }

    /// Remove an item, returning it.
    pub fn remove(&mut self, id: &str) -> Option<QueueItem> {
        let index = self.items.iter().position(|item| item.id == id)?;
        self.parked.remove(id);
        Some(self.items.remove(index))
    }

    /// Hold an item back from processing until [`OfflineQueue::unpark`].
    pub fn park(&mut self, id: &str) -> bool {
        if self.contains(id) {
            self.parked.insert(id.to_string());
            true
        } else {
            false
        }
    }

    /// Release a parked item.
    pub fn unpark(&mut self, id: &str) -> bool {
        self.parked.remove(id)
    }

    /// Check if an item is parked.
    pub fn is_parked(&self, id: &str) -> bool {
        self.parked.contains(id)
    }

    /// Remove every item, returning them in processing order.
    pub fn drain(&mut self) -> Vec<QueueItem> {
        self.parked.clear();
        std::mem::take(&mut self.items)
    }

    /// Remove every item.
    pub fn clear(&mut self) {
        self.items.clear();
        self.parked.clear();
    }

    /// Current depth, including items waiting on a scheduled retry.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the queue has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
