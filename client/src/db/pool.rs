//! Database connection pool and migrations.

use super::StoreError;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Type alias for the database pool.
pub type Pool = SqlitePool;

/// Version of the newest migration this build ships.
pub const SCHEMA_VERSION: i64 = 20250601000000;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

fn is_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Create a new database connection pool.
///
/// File databases use WAL journaling. An in-memory database lives only as
/// long as its connection, so it gets exactly one that is never recycled.
pub async fn create_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    if is_memory(database_url) {
        return SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await;
    }

    options = options
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
}

/// Newest successfully applied migration, if any.
pub async fn schema_version(pool: &Pool) -> Result<Option<i64>, sqlx::Error> {
    let exists: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_optional(pool)
    .await?;
    if exists.is_none() {
        return Ok(None);
    }
    sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await
}

/// Run database migrations.
///
/// A database that recorded a migration this build does not know was
/// written by a newer build and is refused rather than touched.
pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    match MIGRATOR.run(pool).await {
        Ok(()) => {
            tracing::info!(version = SCHEMA_VERSION, "Database schema ready");
            Ok(())
        }
        Err(MigrateError::VersionMissing(found)) => Err(StoreError::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        }),
        Err(e) => Err(e.into()),
    }
}
