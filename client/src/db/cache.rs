//! Database operations for the cache_metadata table.

use super::StoreError;
use encore_engine::CachedResponse;
use sqlx::{Row, SqlitePool};

/// A stored cache row from the database.
#[derive(Debug)]
struct StoredResponse {
    url: String,
    strategy: String,
    stored_at: i64,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for StoredResponse {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredResponse {
            url: row.try_get("url")?,
            strategy: row.try_get("strategy")?,
            stored_at: row.try_get("stored_at")?,
            content_type: row.try_get("content_type")?,
            body: row.try_get("body")?,
        })
    }
}

impl From<StoredResponse> for CachedResponse {
    fn from(row: StoredResponse) -> Self {
        CachedResponse {
            url: row.url,
            strategy: row.strategy,
            stored_at: row.stored_at as u64,
            body: row.body,
            content_type: row.content_type,
        }
    }
}

pub async fn upsert_response(
    pool: &SqlitePool,
    response: &CachedResponse,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO cache_metadata (url, strategy, stored_at, content_type, body)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(url) DO UPDATE SET
            strategy = excluded.strategy,
            stored_at = excluded.stored_at,
            content_type = excluded.content_type,
            body = excluded.body
        "#,
    )
    .bind(&response.url)
    .bind(&response.strategy)
    .bind(response.stored_at as i64)
    .bind(&response.content_type)
    .bind(&response.body)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_response(pool: &SqlitePool, url: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM cache_metadata WHERE url = ?")
        .bind(url)
        .execute(pool)
        .await?;
    Ok(())
}

/// All cached responses, oldest first.
pub async fn load_responses(pool: &SqlitePool) -> Result<Vec<CachedResponse>, StoreError> {
    let rows = sqlx::query_as::<_, StoredResponse>(
        r#"
        SELECT url, strategy, stored_at, content_type, body
        FROM cache_metadata
        ORDER BY stored_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(CachedResponse::from).collect())
}
