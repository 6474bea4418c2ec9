//! Relational store bootstrap
//!
//! Tables:
//! - `tier(id, concurrency, quota, priority)`, row id 0 is the anonymous tier
//! - `users(id, api_key, tier)` joined into `user_view`
//! - `log(time, uid, status, search_time)`, one row per finished search request
//! - `<queue>(path, status, created_at)`, one per hash algorithm

pub mod models;

pub use models::*;

use crate::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Open (or create) the database file behind a pool with a bounded acquire wait
pub async fn init_database_pool(db_path: &Path, acquire_timeout: Duration) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .busy_timeout(acquire_timeout);

    let pool = SqlitePoolOptions::new()
        .acquire_timeout(acquire_timeout)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Single-connection in-memory database (tests, dry runs)
///
/// Every SQLite `:memory:` connection is its own database, so the pool is
/// pinned to one connection that never idles out.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

/// Create the account and log tables used by the search service
pub async fn init_search_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tier (
            id INTEGER PRIMARY KEY,
            concurrency INTEGER NOT NULL,
            quota INTEGER NOT NULL,
            priority INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT OR IGNORE INTO tier (id, concurrency, quota, priority) VALUES (0, 1, 1000, 0)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            api_key TEXT NOT NULL UNIQUE,
            tier INTEGER NOT NULL DEFAULT 0 REFERENCES tier(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE VIEW IF NOT EXISTS user_view AS
        SELECT users.id AS id,
               users.api_key AS api_key,
               tier.quota AS quota,
               tier.concurrency AS concurrency,
               tier.priority AS priority
        FROM users JOIN tier ON users.tier = tier.id
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS log (
            time TEXT NOT NULL,
            uid TEXT NOT NULL,
            status INTEGER NOT NULL,
            search_time INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_uid_time ON log (uid, time)")
        .execute(pool)
        .await?;

    tracing::info!("Database tables initialized (tier, users, user_view, log)");
    Ok(())
}

/// Create the file processing queue for one hash algorithm
pub async fn init_queue_table(pool: &SqlitePool, table: &str) -> Result<()> {
    validate_table_name(table)?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            path TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"CREATE INDEX IF NOT EXISTS "idx_{table}_status" ON "{table}" (status, created_at)"#
    ))
    .execute(pool)
    .await?;

    tracing::info!(table, "Queue table initialized");
    Ok(())
}

/// Queue table names are interpolated into SQL, so only `[A-Za-z0-9_]` is allowed
pub fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid queue table name: {:?}", name)))
    }
}
