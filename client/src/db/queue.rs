//! Database operations for the offline_queue table.

use super::StoreError;
use encore_engine::{ItemId, ItemMetadata, OperationType, Priority, QueueItem};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

/// A stored queue row from the database.
#[derive(Debug)]
pub struct StoredQueueItem {
    pub id: String,
    pub seq: i64,
    pub operation_type: String,
    pub payload: String,
    pub priority: i64,
    pub enqueued_at: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub use_backoff: bool,
    pub dependencies: String,
    pub metadata: String,
    pub entity_key: Option<String>,
    pub next_attempt_at: Option<i64>,
    pub base_version: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredQueueItem {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredQueueItem {
            id: row.try_get("id")?,
            seq: row.try_get("seq")?,
            operation_type: row.try_get("operation_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            enqueued_at: row.try_get("enqueued_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            use_backoff: row.try_get("use_backoff")?,
            dependencies: row.try_get("dependencies")?,
            metadata: row.try_get("metadata")?,
            entity_key: row.try_get("entity_key")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            base_version: row.try_get("base_version")?,
        })
    }
}

impl StoredQueueItem {
    /// Flatten an item into its row form.
    pub fn from_item(item: &QueueItem) -> Result<Self, StoreError> {
        Ok(StoredQueueItem {
            id: item.id.clone(),
            seq: item.seq as i64,
            operation_type: item.operation_type.as_str().to_string(),
            payload: serde_json::to_string(&item.payload)?,
            priority: item.priority.weight(),
            enqueued_at: item.enqueued_at as i64,
            retry_count: i64::from(item.retry_count),
            max_retries: i64::from(item.max_retries),
            use_backoff: item.use_backoff,
            dependencies: serde_json::to_string(&item.dependencies)?,
            metadata: serde_json::to_string(&item.metadata)?,
            entity_key: item.entity_key.clone(),
            next_attempt_at: item.next_attempt_at.map(|t| t as i64),
            base_version: item.base_version.map(|v| v as i64),
        })
    }

    /// Convert database row to a queue item.
    pub fn to_item(&self) -> Result<QueueItem, StoreError> {
        let operation_type = OperationType::parse(&self.operation_type).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "item {}: unknown operation type {}",
                self.id, self.operation_type
            ))
        })?;
        let priority = Priority::from_weight(self.priority).ok_or_else(|| {
            StoreError::Corrupt(format!("item {}: unknown priority {}", self.id, self.priority))
        })?;
        let metadata: ItemMetadata = serde_json::from_str(&self.metadata)?;

        Ok(QueueItem {
            id: self.id.clone(),
            seq: self.seq as u64,
            operation_type,
            payload: serde_json::from_str(&self.payload)?,
            priority,
            enqueued_at: self.enqueued_at as u64,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            use_backoff: self.use_backoff,
            dependencies: serde_json::from_str(&self.dependencies)?,
            metadata,
            entity_key: self.entity_key.clone(),
            next_attempt_at: self.next_attempt_at.map(|t| t as u64),
            base_version: self.base_version.map(|v| v as u64),
        })
    }
}

const SELECT_ITEMS: &str = r#"
    SELECT id, seq, operation_type, payload, priority, enqueued_at,
           retry_count, max_retries, use_backoff, dependencies, metadata,
           entity_key, next_attempt_at, base_version
    FROM offline_queue
"#;

/// Insert an item, replacing any row with the same id.
pub async fn upsert_item(pool: &SqlitePool, item: &QueueItem) -> Result<(), StoreError> {
    let row = StoredQueueItem::from_item(item)?;

    sqlx::query(
        r#"
        INSERT INTO offline_queue (
            id, seq, operation_type, payload, priority, enqueued_at,
            retry_count, max_retries, use_backoff, dependencies, metadata,
            entity_key, next_attempt_at, base_version
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            priority = excluded.priority,
            retry_count = excluded.retry_count,
            max_retries = excluded.max_retries,
            use_backoff = excluded.use_backoff,
            dependencies = excluded.dependencies,
            metadata = excluded.metadata,
            entity_key = excluded.entity_key,
            next_attempt_at = excluded.next_attempt_at,
            base_version = excluded.base_version
        "#,
    )
    .bind(&row.id)
    .bind(row.seq)
    .bind(&row.operation_type)
    .bind(&row.payload)
    .bind(row.priority)
    .bind(row.enqueued_at)
    .bind(row.retry_count)
    .bind(row.max_retries)
    .bind(row.use_backoff)
    .bind(&row.dependencies)
    .bind(&row.metadata)
    .bind(&row.entity_key)
    .bind(row.next_attempt_at)
    .bind(row.base_version)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_item(pool: &SqlitePool, id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM offline_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Every item in processing order.
pub async fn load_items(pool: &SqlitePool) -> Result<Vec<QueueItem>, StoreError> {
    let sql = format!("{SELECT_ITEMS} ORDER BY priority DESC, enqueued_at ASC, seq ASC");
    let rows = sqlx::query_as::<_, StoredQueueItem>(&sql)
        .fetch_all(pool)
        .await?;
    rows.iter().map(StoredQueueItem::to_item).collect()
}

/// Items of one operation type, in processing order.
pub async fn load_items_by_type(
    pool: &SqlitePool,
    operation_type: OperationType,
) -> Result<Vec<QueueItem>, StoreError> {
    let sql = format!(
        "{SELECT_ITEMS} WHERE operation_type = ? ORDER BY priority DESC, enqueued_at ASC, seq ASC"
    );
    let rows = sqlx::query_as::<_, StoredQueueItem>(&sql)
        .bind(operation_type.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(StoredQueueItem::to_item).collect()
}

/// Delete the listed items in one statement. Other rows are untouched.
pub async fn delete_items(pool: &SqlitePool, ids: &[ItemId]) -> Result<(), StoreError> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM offline_queue WHERE id IN (");
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(id.as_str());
    }
    separated.push_unseparated(")");
    query.build().execute(pool).await?;
    Ok(())
}
