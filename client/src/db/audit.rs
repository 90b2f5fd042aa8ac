//! Database operations for the audit_log table.
//!
//! Rows are only ever inserted. `recorded_at` keeps the wall-clock time of
//! the write for operators reading the table directly.

use super::StoreError;
use encore_engine::{AuditLogEntry, AuditOutcome};
use sqlx::{Row, SqlitePool};

#[derive(Debug)]
struct StoredAuditEntry {
    seq: i64,
    entity_id: String,
    item_id: Option<String>,
    operation_name: Option<String>,
    actor: Option<String>,
    before_value: Option<String>,
    after_value: Option<String>,
    outcome: String,
    timestamp: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredAuditEntry {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredAuditEntry {
            seq: row.try_get("seq")?,
            entity_id: row.try_get("entity_id")?,
            item_id: row.try_get("item_id")?,
            operation_name: row.try_get("operation_name")?,
            actor: row.try_get("actor")?,
            before_value: row.try_get("before_value")?,
            after_value: row.try_get("after_value")?,
            outcome: row.try_get("outcome")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

impl StoredAuditEntry {
    fn to_entry(&self) -> Result<AuditLogEntry, StoreError> {
        let outcome = AuditOutcome::parse(&self.outcome).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "audit entry {}: unknown outcome {}",
                self.seq, self.outcome
            ))
        })?;
        Ok(AuditLogEntry {
            seq: self.seq as u64,
            entity_id: self.entity_id.clone(),
            item_id: self.item_id.clone(),
            operation_name: self.operation_name.clone(),
            actor: self.actor.clone(),
            before: decode(self.before_value.as_deref())?,
            after: decode(self.after_value.as_deref())?,
            outcome,
            timestamp: self.timestamp as u64,
        })
    }
}

fn encode(value: Option<&serde_json::Value>) -> Result<Option<String>, StoreError> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

fn decode(raw: Option<&str>) -> Result<Option<serde_json::Value>, StoreError> {
    Ok(raw.map(serde_json::from_str).transpose()?)
}

pub async fn insert_entry(pool: &SqlitePool, entry: &AuditLogEntry) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (
            seq, entity_id, item_id, operation_name, actor,
            before_value, after_value, outcome, timestamp, recorded_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.seq as i64)
    .bind(&entry.entity_id)
    .bind(&entry.item_id)
    .bind(&entry.operation_name)
    .bind(&entry.actor)
    .bind(encode(entry.before.as_ref())?)
    .bind(encode(entry.after.as_ref())?)
    .bind(entry.outcome.as_str())
    .bind(entry.timestamp as i64)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// The whole log in sequence order.
pub async fn load_entries(pool: &SqlitePool) -> Result<Vec<AuditLogEntry>, StoreError> {
    let rows = sqlx::query_as::<_, StoredAuditEntry>(
        r#"
        SELECT seq, entity_id, item_id, operation_name, actor,
               before_value, after_value, outcome, timestamp
        FROM audit_log
        ORDER BY seq ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(StoredAuditEntry::to_entry).collect()
}
