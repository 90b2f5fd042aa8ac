//! Local entity store.
//!
//! The in-memory view of entities the UI reads. Optimistic updates write
//! here first; commits overwrite with the server value and rollbacks restore
//! the value captured before the mutation.

use crate::EntityKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key/value cache of entity values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalCache {
    entities: BTreeMap<EntityKey, serde_json::Value>,
}

impl LocalCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an entity value.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entities.get(key)
    }

    /// Write an entity value, returning the previous one.
    pub fn insert(
        &mut self,
        key: impl Into<EntityKey>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.entities.insert(key.into(), value)
    }

    /// Remove an entity, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.entities.remove(key)
    }

    /// Put back a captured value. `None` means the entity did not exist.
    pub fn restore(&mut self, key: &str, value: Option<serde_json::Value>) {
        match value {
            Some(value) => {
                self.entities.insert(key.to_string(), value);
            }
            None => {
                self.entities.remove(key);
            }
        }
    }

    /// Check if an entity is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entities.contains_key(key)
    }

    /// Entity keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities.keys()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
