//! SQLite store - the durable record backend.
//!
//! One table holds one row per cell, keyed by cell name. Values are stored
//! as JSON text. The async [`SqliteStore::open`] performs connection and
//! schema setup and must complete before reads or writes; the capability
//! resolver guarantees it runs at most once per process.
//!
//! Writes self-heal history: when the caller does not supply a previous
//! value, the existing row's value is re-read and used as the previous
//! value, so history survives callers that raced.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{Backend, StoredRecord};
use crate::error::{Result, StoreError};

/// Durable SQLite implementation of [`Backend`].
///
/// Uses WAL mode for performance and durability. All cells sharing a
/// resolver share one database file.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a SQLite store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite store at {:?}", path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                previous_value TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    async fn try_read(&self, name: &str) -> Result<Option<StoredRecord>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT value, previous_value FROM records WHERE id = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        let Some((value, previous)) = row else {
            return Ok(None);
        };

        Ok(Some(StoredRecord {
            value: serde_json::from_str(&value)?,
            // A previous value that no longer parses is dropped, not fatal.
            previous_value: previous.and_then(|p| serde_json::from_str(&p).ok()),
        }))
    }

    pub(crate) async fn try_write(&self, name: &str, mut record: StoredRecord) -> Result<()> {
        if record.previous_value.is_none() {
            record.previous_value = self.try_read(name).await?.map(|existing| existing.value);
        }

        let value = serde_json::to_string(&record.value)?;
        let previous = record
            .previous_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO records (id, value, previous_value)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                value = excluded.value,
                previous_value = excluded.previous_value
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(previous)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_delete(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteStore {
    async fn read(&self, name: &str) -> Option<StoredRecord> {
        match self.try_read(name).await {
            Ok(record) => record,
            Err(err) => {
                warn!(%name, %err, "sqlite read failed, treating record as absent");
                None
            }
        }
    }

    async fn write(&self, name: &str, record: StoredRecord) {
        if let Err(err) = self.try_write(name, record).await {
            warn!(%name, %err, "dropping sqlite write");
        }
    }

    async fn delete(&self, name: &str) {
        if let Err(err) = self.try_delete(name).await {
            warn!(%name, %err, "sqlite delete failed");
        }
    }
}
