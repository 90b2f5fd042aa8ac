//! In-memory [`DurableStore`] with failure injection.

use super::{DurableStore, StoreError};
use async_trait::async_trait;
use encore_engine::{
    AuditLogEntry, CachedResponse, ItemId, OperationType, PerformanceSample, QueueItem, Timestamp,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Inner {
    items: BTreeMap<String, QueueItem>,
    cached: BTreeMap<String, CachedResponse>,
    samples: Vec<PerformanceSample>,
    audit: Vec<AuditLogEntry>,
}

/// Store that keeps everything in process memory.
///
/// `fail_writes` and `fail_reads` make the matching calls return
/// [`StoreError::Unavailable`] so hosts can exercise persistence failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of persisted queue items.
    pub fn item_count(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn item(&self, id: &str) -> Option<QueueItem> {
        self.inner.lock().items.get(id).cloned()
    }

    pub fn audit_len(&self) -> usize {
        self.inner.lock().audit.len()
    }

    fn write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(())
    }
}

fn ordered(items: impl Iterator<Item = QueueItem>) -> Vec<QueueItem> {
    let mut items: Vec<QueueItem> = items.collect();
    items.sort_by(|a, b| a.queue_order(b));
    items
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        self.write()?;
        self.inner.lock().items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> Result<(), StoreError> {
        self.write()?;
        self.inner.lock().items.remove(id);
        Ok(())
    }

    async fn load_items(&self) -> Result<Vec<QueueItem>, StoreError> {
        self.read()?;
        let inner = self.inner.lock();
        Ok(ordered(inner.items.values().cloned()))
    }

    async fn load_items_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<QueueItem>, StoreError> {
        self.read()?;
        let inner = self.inner.lock();
        Ok(ordered(
            inner
                .items
                .values()
                .filter(|i| i.operation_type == operation_type)
                .cloned(),
        ))
    }

    async fn delete_items(&self, ids: &[ItemId]) -> Result<(), StoreError> {
        self.write()?;
        let mut inner = self.inner.lock();
        for id in ids {
            inner.items.remove(id);
        }
        Ok(())
    }

    async fn put_cached(&self, response: &CachedResponse) -> Result<(), StoreError> {
        self.write()?;
        self.inner
            .lock()
            .cached
            .insert(response.url.clone(), response.clone());
        Ok(())
    }

    async fn delete_cached(&self, url: &str) -> Result<(), StoreError> {
        self.write()?;
        self.inner.lock().cached.remove(url);
        Ok(())
    }

    async fn load_cached(&self) -> Result<Vec<CachedResponse>, StoreError> {
        self.read()?;
        let mut cached: Vec<CachedResponse> = self.inner.lock().cached.values().cloned().collect();
        cached.sort_by_key(|c| c.stored_at);
        Ok(cached)
    }

    async fn record_metrics(&self, sample: &PerformanceSample) -> Result<(), StoreError> {
        self.write()?;
        self.inner.lock().samples.push(sample.clone());
        Ok(())
    }

    async fn metrics_since(&self, since: Timestamp) -> Result<Vec<PerformanceSample>, StoreError> {
        self.read()?;
        let inner = self.inner.lock();
        Ok(inner
            .samples
            .iter()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        self.write()?;
        self.inner.lock().audit.push(entry.clone());
        Ok(())
    }

    async fn load_audit(&self) -> Result<Vec<AuditLogEntry>, StoreError> {
        self.read()?;
        Ok(self.inner.lock().audit.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_engine::{ItemMetadata, NewItem, Priority};
    use serde_json::json;

    fn item(id: &str, seq: u64, priority: Priority) -> QueueItem {
        QueueItem::from_request(
            id,
            seq,
            NewItem::new(
                OperationType::Mutation,
                json!({}),
                priority,
                ItemMetadata::new("updateShow"),
            ),
            1_000,
        )
    }

    #[tokio::test]
    async fn loads_in_processing_order() {
        let store = MemoryStore::new();
        store.put_item(&item("a", 0, Priority::Low)).await.unwrap();
        store.put_item(&item("b", 1, Priority::Critical)).await.unwrap();
        store.put_item(&item("c", 2, Priority::Low)).await.unwrap();

        let ids: Vec<String> = store
            .load_items()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let err = store.put_item(&item("a", 0, Priority::Low)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.item_count(), 0);

        store.fail_writes(false);
        store.fail_reads(true);
        store.put_item(&item("a", 0, Priority::Low)).await.unwrap();
        assert!(store.load_items().await.is_err());
    }
}
