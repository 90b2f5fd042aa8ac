//! Optimistic update controller.
//!
//! Applying an optimistic update writes the new value into the
//! [`LocalCache`] immediately and keeps an [`OptimisticSnapshot`] of what was
//! there before, keyed by the queue item that carries the change. The
//! snapshot is consumed exactly once: by [`OptimisticController::commit`]
//! when the server accepts the change, or by
//! [`OptimisticController::rollback`] when it is rejected or cancelled.
//!
//! Several items may touch the same entity. Rolling back an older one hands
//! its prior value down to the next newer snapshot so the newer optimistic
//! value stays visible; rolling back the newest restores the cache.

use crate::{error::Result, EntityKey, Error, ItemId, LocalCache, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pre-mutation state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticSnapshot {
    pub item_id: ItemId,
    pub entity_key: EntityKey,
    /// Value before the mutation; `None` if the entity did not exist
    pub prior: Option<serde_json::Value>,
    /// Value written optimistically
    pub applied: serde_json::Value,
    pub created_at: Timestamp,
    /// Creation order among all snapshots
    order: u64,
    /// Set when a newer change to the entity committed; rollback then
    /// leaves the cache alone
    superseded: bool,
}

/// Owner of every outstanding optimistic snapshot.
#[derive(Debug, Clone, Default)]
pub struct OptimisticController {
    snapshots: BTreeMap<ItemId, OptimisticSnapshot>,
    next_order: u64,
}

impl OptimisticController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` to the cache and remember what it replaced.
    pub fn apply(
        &mut self,
        cache: &mut LocalCache,
        entity_key: impl Into<EntityKey>,
        value: serde_json::Value,
        item_id: impl Into<ItemId>,
        now: Timestamp,
    ) -> Result<&OptimisticSnapshot> {
        let item_id = item_id.into();
        let entity_key = entity_key.into();
        if entity_key.is_empty() {
            return Err(Error::EmptyEntityKey);
        }
        if self.snapshots.contains_key(&item_id) {
            return Err(Error::SnapshotExists(item_id));
        }

        let prior = cache.insert(entity_key.clone(), value.clone());
        let order = self.next_order;
        self.next_order += 1;

        let snapshot = OptimisticSnapshot {
            item_id: item_id.clone(),
            entity_key,
            prior,
            applied: value,
            created_at: now,
            order,
            superseded: false,
        };
        Ok(self.snapshots.entry(item_id).or_insert(snapshot))
    }

    /// Discard the snapshot of a committed item. The cache is untouched.
    ///
    /// Returns `None` if the item has no snapshot (never had one, or it was
    /// already committed or rolled back).
    pub fn commit(&mut self, item_id: &str) -> Option<OptimisticSnapshot> {
        let snapshot = self.snapshots.remove(item_id)?;
        for older in self.snapshots.values_mut() {
            if older.entity_key == snapshot.entity_key && older.order < snapshot.order {
                older.superseded = true;
            }
        }
        Some(snapshot)
    }

    /// Undo an item's optimistic write.
    ///
    /// Returns `None` if the item has no snapshot.
    pub fn rollback(
        &mut self,
        cache: &mut LocalCache,
        item_id: &str,
    ) -> Option<OptimisticSnapshot> {
        let snapshot = self.snapshots.remove(item_id)?;

        let newer = self
            .snapshots
            .values_mut()
            .filter(|s| s.entity_key == snapshot.entity_key && s.order > snapshot.order)
            .min_by_key(|s| s.order);

        match newer {
            Some(next) => next.prior = snapshot.prior.clone(),
            None if !snapshot.superseded => {
                cache.restore(&snapshot.entity_key, snapshot.prior.clone());
            }
            None => {}
        }
        Some(snapshot)
    }

    /// Replace the value an item wrote, keeping its prior.
    ///
    /// The cache shows `value` only while no newer change to the entity is
    /// outstanding. Returns `false` if the item has no snapshot.
    pub fn reapply(
        &mut self,
        cache: &mut LocalCache,
        item_id: &str,
        value: serde_json::Value,
    ) -> bool {
        let Some(snapshot) = self.snapshots.get(item_id) else {
            return false;
        };
        let entity_key = snapshot.entity_key.clone();
        let visible = !snapshot.superseded
            && !self
                .snapshots
                .values()
                .any(|s| s.entity_key == entity_key && s.order > snapshot.order);

        if visible {
            cache.insert(entity_key, value.clone());
        }
        if let Some(snapshot) = self.snapshots.get_mut(item_id) {
            snapshot.applied = value;
        }
        true
    }

    /// Roll back every outstanding snapshot, newest first.
    pub fn rollback_all(&mut self, cache: &mut LocalCache) -> Vec<OptimisticSnapshot> {
        self.rollback_where(cache, |_| true)
    }

    /// Roll back every snapshot whose item id matches, newest first.
    pub fn rollback_where<F>(
        &mut self,
        cache: &mut LocalCache,
        mut predicate: F,
    ) -> Vec<OptimisticSnapshot>
    where
        F: FnMut(&str) -> bool,
    {
        let mut targets: Vec<(u64, ItemId)> = self
            .snapshots
            .values()
            .filter(|s| predicate(&s.item_id))
            .map(|s| (s.order, s.item_id.clone()))
            .collect();
        targets.sort_by(|a, b| b.0.cmp(&a.0));

        targets
            .into_iter()
            .filter_map(|(_, id)| self.rollback(cache, &id))
            .collect()
    }

    /// Snapshot held for an item.
    pub fn get(&self, item_id: &str) -> Option<&OptimisticSnapshot> {
        self.snapshots.get(item_id)
    }

    /// Outstanding snapshots for an entity, oldest first.
    pub fn for_entity(&self, entity_key: &str) -> Vec<&OptimisticSnapshot> {
        let mut found: Vec<_> = self
            .snapshots
            .values()
            .filter(|s| s.entity_key == entity_key)
            .collect();
        found.sort_by_key(|s| s.order);
        found
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
