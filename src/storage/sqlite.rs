//! SQLite-backed quota and state store.
//!
//! SYSTEM CONTEXT
//! ==============
//! One row per client in `client_rate_limits`; the table is created on
//! first open. `last_refill` is stored as an RFC 3339 string with
//! nanosecond precision so the value round-trips exactly; the empty string
//! means "not yet set". Writes are serialized through a single-writer lock
//! around each statement/transaction, which keeps SQLite happy under
//! concurrent admin traffic and batch state saves.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{QuotaRecord, QuotaStore, SavedState, StateStore, StorageError};

const MAX_CONNECTIONS: u32 = 5;

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS client_rate_limits (
    client_id      TEXT PRIMARY KEY,
    rate           REAL NOT NULL,
    capacity       REAL NOT NULL,
    current_tokens REAL NOT NULL DEFAULT 0.0,
    last_refill    TEXT NOT NULL DEFAULT ''
)";

/// SQLite store satisfying both [`QuotaStore`] and [`StateStore`].
pub struct Db {
    pool: SqlitePool,
    /// Single-writer lock: SQLite allows one writer at a time, so mutating
    /// statements queue here instead of surfacing SQLITE_BUSY.
    write_lock: Mutex<()>,
}

impl Db {
    /// Open (or create) the database file and ensure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or the schema
    /// cannot be created.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::init(pool, path).await
    }

    /// In-memory database on a single connection (each SQLite `:memory:`
    /// connection is its own database, so the pool must not grow).
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool, ":memory:").await
    }

    async fn init(pool: SqlitePool, path: &str) -> Result<Self, StorageError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        info!(path, "sqlite quota store ready");
        Ok(Self { pool, write_lock: Mutex::new(()) })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl QuotaStore for Db {
    async fn get_quota(&self, client_id: &str) -> Result<Option<QuotaRecord>, StorageError> {
        let row = sqlx::query_as::<_, (f64, f64)>(
            "SELECT rate, capacity FROM client_rate_limits WHERE client_id = ?",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(rate, capacity)| QuotaRecord { rate, capacity }))
    }

    async fn create_quota(&self, client_id: &str, quota: QuotaRecord) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        // Seed initial state in the same row: full bucket, refill from now.
        let result = sqlx::query(
            "INSERT INTO client_rate_limits (client_id, rate, capacity, current_tokens, last_refill)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(client_id)
        .bind(quota.rate)
        .bind(quota.capacity)
        .bind(quota.capacity)
        .bind(format_last_refill(Some(Utc::now())))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(client_id, rate = quota.rate, capacity = quota.capacity, "client limit created");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(StorageError::AlreadyExists(client_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_quota(&self, client_id: &str, quota: QuotaRecord) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            "UPDATE client_rate_limits SET rate = ?, capacity = ? WHERE client_id = ?",
        )
        .bind(quota.rate)
        .bind(quota.capacity)
        .bind(client_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(client_id.to_string()));
        }
        info!(client_id, rate = quota.rate, capacity = quota.capacity, "client limit updated");
        Ok(())
    }

    async fn delete_quota(&self, client_id: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("DELETE FROM client_rate_limits WHERE client_id = ?")
            .bind(client_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(client_id.to_string()));
        }
        info!(client_id, "client limit deleted");
        Ok(())
    }

    fn supports_state_persistence(&self) -> bool {
        true
    }

    fn state_store(&self) -> Option<&dyn StateStore> {
        Some(self)
    }
}

#[async_trait]
impl StateStore for Db {
    async fn get_state(&self, client_id: &str) -> Result<Option<SavedState>, StorageError> {
        let row = sqlx::query(
            "SELECT current_tokens, last_refill FROM client_rate_limits WHERE client_id = ?",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tokens: f64 = row.try_get("current_tokens")?;
        let raw: String = row.try_get("last_refill")?;
        Ok(Some(SavedState { tokens, last_refill: parse_last_refill(client_id, &raw) }))
    }

    async fn batch_update_state(
        &self,
        states: &HashMap<String, SavedState>,
    ) -> Result<usize, StorageError> {
        if states.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut updated = 0usize;

        for (client_id, state) in states {
            let result = sqlx::query(
                "UPDATE client_rate_limits SET current_tokens = ?, last_refill = ? WHERE client_id = ?",
            )
            .bind(state.tokens)
            .bind(format_last_refill(state.last_refill))
            .bind(client_id.as_str())
            .execute(tx.as_mut())
            .await?;

            // A row can vanish between snapshot and write when an admin
            // deletes the client; that is counted, not fatal.
            if result.rows_affected() > 0 {
                updated += 1;
            }
        }

        tx.commit().await?;

        if updated < states.len() {
            warn!(
                updated,
                total = states.len(),
                "some clients were deleted while their state was being saved"
            );
        }
        Ok(updated)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error().is_some_and(|db| db.is_unique_violation())
}

/// RFC 3339 with nanoseconds, or the empty string for "not yet set".
fn format_last_refill(last_refill: Option<DateTime<Utc>>) -> String {
    match last_refill {
        Some(t) => t.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => String::new(),
    }
}

/// Empty means "not yet set"; a malformed stored value degrades the same
/// way, with a warning, instead of failing the lookup.
fn parse_last_refill(client_id: &str, raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            warn!(client_id, value = raw, error = %e, "malformed last_refill in store; treating as unset");
            None
        }
    }
}

#[cfg(test)]
#[path = "sqlite_test.rs"]
mod tests;
