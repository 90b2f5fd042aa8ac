//! Database operations for the performance_metrics table.

use super::StoreError;
use encore_engine::{PerformanceMetrics, PerformanceSample, Timestamp};
use sqlx::SqlitePool;

pub async fn insert_sample(
    pool: &SqlitePool,
    sample: &PerformanceSample,
) -> Result<(), StoreError> {
    let metrics = serde_json::to_string(&sample.metrics)?;
    sqlx::query("INSERT INTO performance_metrics (timestamp, metrics) VALUES (?, ?)")
        .bind(sample.timestamp as i64)
        .bind(metrics)
        .execute(pool)
        .await?;
    Ok(())
}

/// Samples at or after `since`, oldest first.
pub async fn samples_since(
    pool: &SqlitePool,
    since: Timestamp,
) -> Result<Vec<PerformanceSample>, StoreError> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT timestamp, metrics
        FROM performance_metrics
        WHERE timestamp >= ?
        ORDER BY timestamp ASC, id ASC
        "#,
    )
    .bind(since as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(timestamp, metrics)| {
            let metrics: PerformanceMetrics = serde_json::from_str(&metrics)?;
            Ok(PerformanceSample {
                timestamp: timestamp as u64,
                metrics,
            })
        })
        .collect()
}
