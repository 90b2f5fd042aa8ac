//! SQLite-backed [`DurableStore`].

use super::{audit, cache, metrics, pool, queue, DurableStore, StoreError};
use async_trait::async_trait;
use encore_engine::{
    AuditLogEntry, CachedResponse, ItemId, OperationType, PerformanceSample, QueueItem, Timestamp,
};
use sqlx::SqlitePool;

/// Durable store on a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `database_url` and bring its schema
    /// up to date.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = pool::create_pool(database_url).await?;
        pool::run_migrations(&pool).await?;
        tracing::info!(database_url, "Durable store ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool whose schema is already migrated.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn put_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        queue::upsert_item(&self.pool, item).await
    }

    async fn delete_item(&self, id: &str) -> Result<(), StoreError> {
        queue::delete_item(&self.pool, id).await
    }

    async fn load_items(&self) -> Result<Vec<QueueItem>, StoreError> {
        queue::load_items(&self.pool).await
    }

    async fn load_items_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<QueueItem>, StoreError> {
        queue::load_items_by_type(&self.pool, operation_type).await
    }

    async fn delete_items(&self, ids: &[ItemId]) -> Result<(), StoreError> {
        queue::delete_items(&self.pool, ids).await
    }

    async fn put_cached(&self, response: &CachedResponse) -> Result<(), StoreError> {
        cache::upsert_response(&self.pool, response).await
    }

    async fn delete_cached(&self, url: &str) -> Result<(), StoreError> {
        cache::delete_response(&self.pool, url).await
    }

    async fn load_cached(&self) -> Result<Vec<CachedResponse>, StoreError> {
        cache::load_responses(&self.pool).await
    }

    async fn record_metrics(&self, sample: &PerformanceSample) -> Result<(), StoreError> {
        metrics::insert_sample(&self.pool, sample).await
    }

    async fn metrics_since(&self, since: Timestamp) -> Result<Vec<PerformanceSample>, StoreError> {
        metrics::samples_since(&self.pool, since).await
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        audit::insert_entry(&self.pool, entry).await
    }

    async fn load_audit(&self) -> Result<Vec<AuditLogEntry>, StoreError> {
        audit::load_entries(&self.pool).await
    }
}
