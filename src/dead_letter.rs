// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead letters: replication messages the consumer gave up on.
//!
//! The consumer calls a [`DeadLetterHook`] once per abandoned message, after the
//! final failed attempt. [`LogDeadLetter`] only logs. [`SqliteDeadLetterStore`]
//! also persists the message so an operator can inspect and replay it.
//!
//! Concurrent abandons can briefly lock the SQLite file; writes are re-run a
//! few times before the error is surfaced.

use crate::error::{DualWriteError, Result};
use crate::invoker::BoxFuture;
use crate::message::ReplicationMessage;
use crate::metrics;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Called once for every abandoned message.
pub trait DeadLetterHook: Send + Sync + 'static {
    fn on_abandoned<'a>(
        &'a self,
        message: &'a ReplicationMessage,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Default hook: nothing beyond the consumer's own error log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDeadLetter;

impl DeadLetterHook for LogDeadLetter {
    fn on_abandoned<'a>(
        &'a self,
        message: &'a ReplicationMessage,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            debug!(message_id = %message.message_id, reason, "Dead letter not persisted");
            Ok(())
        })
    }
}

/// Pauses between attempts when SQLite reports the file busy or locked.
const BUSY_PAUSES_MS: [u64; 4] = [10, 40, 160, 500];

fn is_busy(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
    match db.code().and_then(|c| c.parse::<i32>().ok()) {
        Some(code) => matches!(code & 0xff, 5 | 6),
        None => db.message().contains("database is locked"),
    }
}

/// Run `op`, re-running it while SQLite is busy.
async fn with_busy_retry<F, Fut, T>(label: &str, mut op: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut pauses = BUSY_PAUSES_MS.iter();
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        match pauses.next() {
            Some(ms) if is_busy(&err) => {
                debug!(op = label, pause_ms = *ms, "SQLite busy");
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            _ => return Err(err),
        }
    }
}

/// A persisted dead letter.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub message: ReplicationMessage,
    pub reason: String,
    /// Unix millis when the message was abandoned.
    pub abandoned_at: i64,
}

/// Dead letters in a local SQLite file, keyed by message id.
///
/// A message abandoned twice (redelivered after a crash) overwrites its row.
pub struct SqliteDeadLetterStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteDeadLetterStore {
    /// Open (creating if missing) the store at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening dead-letter store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| DualWriteError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                message_id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                target_store TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                payload TEXT NOT NULL,
                abandoned_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Persist `message`, replacing any earlier row for the same id.
    pub async fn record(&self, message: &ReplicationMessage, reason: &str) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let operation = message.operation.to_string();
        let target = message.target_store.as_str();
        let retry_count = i64::from(message.retry_count);
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        with_busy_retry("dead_letter_record", || async {
            sqlx::query(
                r#"
                INSERT INTO dead_letters
                    (message_id, operation, target_store, retry_count, reason, payload, abandoned_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(message_id) DO UPDATE SET
                    retry_count = excluded.retry_count,
                    reason = excluded.reason,
                    payload = excluded.payload,
                    abandoned_at = excluded.abandoned_at
                "#,
            )
            .bind(&message.message_id)
            .bind(&operation)
            .bind(target)
            .bind(retry_count)
            .bind(reason)
            .bind(&payload)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(message_id = %message.message_id, "Dead letter persisted");
        Ok(())
    }

    /// Oldest first, at most `limit`.
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT payload, reason, abandoned_at FROM dead_letters ORDER BY abandoned_at, message_id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            entries.push(DeadLetterEntry {
                message: serde_json::from_str(&payload)?,
                reason: row.try_get("reason")?,
                abandoned_at: row.try_get("abandoned_at")?,
            });
        }
        Ok(entries)
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Delete one entry, typically after it was replayed. Returns whether it existed.
    pub async fn remove(&self, message_id: &str) -> Result<bool> {
        let pool = &self.pool;
        let result = with_busy_retry("dead_letter_remove", || async {
            sqlx::query("DELETE FROM dead_letters WHERE message_id = ?")
                .bind(message_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        let pool = &self.pool;
        let checkpoint = with_busy_retry("dead_letter_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await;
        if let Err(e) = checkpoint {
            warn!(error = %e, "Failed to checkpoint dead-letter WAL on close");
        }
        self.pool.close().await;
        info!("Dead-letter store closed");
    }
}

impl DeadLetterHook for SqliteDeadLetterStore {
    fn on_abandoned<'a>(
        &'a self,
        message: &'a ReplicationMessage,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let result = self.record(message, reason).await;
            metrics::record_dead_letter_persist(result.is_ok());
            if let Err(e) = &result {
                error!(message_id = %message.message_id, error = %e, "Failed to persist dead letter");
            }
            result
        })
    }
}
