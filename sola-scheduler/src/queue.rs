//! File processing queue
//!
//! One table per hash algorithm. Rows move strictly forward:
//! `UPLOADED → HASHING → HASHED → LOADING → LOADED`. The scheduler performs
//! the two claim transitions; workers report the others out of band.

use crate::error::{Result, SchedulerError};
use sola_common::db::{init_queue_table, validate_table_name, QueueStatus};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    table: String,
}

impl JobQueue {
    /// Open the queue table, creating it if needed
    pub async fn open(pool: SqlitePool, table: &str) -> Result<Self> {
        init_queue_table(&pool, table).await?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Queue over an existing table
    pub fn new(pool: SqlitePool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Register a new upload; an existing path is left untouched
    pub async fn enqueue(&self, path: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"INSERT OR IGNORE INTO "{}" (path, status) VALUES (?, ?)"#,
            self.table
        ))
        .bind(path)
        .bind(QueueStatus::Uploaded.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Oldest row currently in `status`
    pub async fn oldest_with_status(&self, status: QueueStatus) -> Result<Option<String>> {
        let path = sqlx::query_scalar(&format!(
            r#"SELECT path FROM "{}" WHERE status = ? ORDER BY created_at, rowid LIMIT 1"#,
            self.table
        ))
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(path)
    }

    pub async fn count_with_status(&self, status: QueueStatus) -> Result<i64> {
        let count = sqlx::query_scalar(&format!(
            r#"SELECT COUNT(*) FROM "{}" WHERE status = ?"#,
            self.table
        ))
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Compare-and-set status change; false when the row was not in `from`
    pub async fn transition(&self, path: &str, from: QueueStatus, to: QueueStatus) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"UPDATE "{}" SET status = ? WHERE path = ? AND status = ?"#,
            self.table
        ))
        .bind(to.as_str())
        .bind(path)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn status_of(&self, path: &str) -> Result<Option<QueueStatus>> {
        let status: Option<String> = sqlx::query_scalar(&format!(
            r#"SELECT status FROM "{}" WHERE path = ?"#,
            self.table
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        status
            .map(|s| s.parse::<QueueStatus>().map_err(SchedulerError::from))
            .transpose()
    }
}
