//! Durable storage for the offline queue and its companions.
//!
//! Four collections survive restarts: the offline queue itself, cache
//! metadata (cached response bodies), performance metric samples and the
//! audit log. [`SqliteStore`] is the production backend; [`MemoryStore`]
//! serves tests and ephemeral hosts.

mod audit;
mod cache;
mod memory;
mod metrics;
mod pool;
mod queue;
mod sqlite;

pub use memory::MemoryStore;
pub use pool::{create_pool, run_migrations, schema_version, Pool, SCHEMA_VERSION};
pub use queue::StoredQueueItem;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use encore_engine::{
    AuditLogEntry, CachedResponse, ItemId, OperationType, PerformanceSample, QueueItem, Timestamp,
};

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Stored schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence used by the sync engine.
///
/// Every write completes before the call returns; the engine relies on
/// this to acknowledge an enqueue only after the item is durable.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or replace a queue item.
    async fn put_item(&self, item: &QueueItem) -> Result<(), StoreError>;

    async fn delete_item(&self, id: &str) -> Result<(), StoreError>;

    /// Every queued item, in processing order.
    async fn load_items(&self) -> Result<Vec<QueueItem>, StoreError>;

    async fn load_items_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Delete exactly the listed items.
    async fn delete_items(&self, ids: &[ItemId]) -> Result<(), StoreError>;

    /// Insert or replace a cached response, keyed by URL.
    async fn put_cached(&self, response: &CachedResponse) -> Result<(), StoreError>;

    async fn delete_cached(&self, url: &str) -> Result<(), StoreError>;

    async fn load_cached(&self) -> Result<Vec<CachedResponse>, StoreError>;

    async fn record_metrics(&self, sample: &PerformanceSample) -> Result<(), StoreError>;

    /// Samples taken at or after `since`, oldest first.
    async fn metrics_since(&self, since: Timestamp) -> Result<Vec<PerformanceSample>, StoreError>;

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StoreError>;

    /// The whole audit log in sequence order.
    async fn load_audit(&self) -> Result<Vec<AuditLogEntry>, StoreError>;
}
