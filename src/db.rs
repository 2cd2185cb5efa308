//! SQLite connection and schema for the checkpoint store.
//!
//! - Connection pool management
//! - WAL mode for concurrent reads
//! - Idempotent schema creation on open
//!
//! # Example
//!
//! ```no_run
//! use docfetch_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("checkpoints.db")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
/// Connections will wait this long before returning SQLITE_BUSY.
const BUSY_TIMEOUT_MS: u32 = 5000;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
    job_key    TEXT PRIMARY KEY NOT NULL,
    body       TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Connection or query failure.
    #[error("database error: {0}")]
    Connection(#[from] sqlx::Error),
}

/// Database connection wrapper with connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `db_path`, enables WAL and
    /// ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if connecting or schema creation fails.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        // Avoid immediate SQLITE_BUSY under concurrent writers
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// A single connection is used so every query sees the same database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.eq_ignore_ascii_case("wal"))
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_new_in_memory_creates_schema() {
        let db = Database::new_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO checkpoints (job_key, body, updated_at) VALUES ('job', '{}', 0)",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_ok(), "checkpoints table should exist");
    }

    #[tokio::test]
    async fn test_database_job_key_is_unique() {
        let db = Database::new_in_memory().await.unwrap();
        let insert = "INSERT INTO checkpoints (job_key, body, updated_at) VALUES ('job', '{}', 0)";
        sqlx::query(insert).execute(db.pool()).await.unwrap();
        assert!(sqlx::query(insert).execute(db.pool()).await.is_err());
    }

    #[tokio::test]
    async fn test_database_with_tempfile_enables_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db.is_wal_enabled().await.unwrap());

        // Reopening is idempotent
        db.close().await;
        assert!(Database::new(&db_path).await.is_ok());
    }
}
