//! Durable per-client quota and bucket-state storage.
//!
//! DESIGN
//! ======
//! Two capabilities behind traits: `QuotaStore` is the admin-configured
//! `(rate, capacity)` map, `StateStore` the serialized bucket state
//! `(tokens, last_refill)`. A backing implementation may satisfy one or
//! both; the engine probes `supports_state_persistence` and fetches the
//! `StateStore` view through `state_store()` instead of downcasting.
//!
//! ERROR HANDLING
//! ==============
//! Callers branch on error *kind* (`is_not_found`, `is_already_exists`),
//! never on message text. Storage failures on the request hot path degrade
//! to defaults upstream; they are fatal only at construction time.

mod sqlite;

pub use sqlite::Db;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("client '{0}' not found")]
    NotFound(String),
    #[error("client '{0}' already exists")]
    AlreadyExists(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// Admin-configured per-client override. A missing record means
/// "use the configured defaults".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaRecord {
    /// Tokens per second.
    pub rate: f64,
    pub capacity: f64,
}

/// Serialized bucket state. `last_refill: None` means "not yet set";
/// the engine starts refilling from its next observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SavedState {
    pub tokens: f64,
    pub last_refill: Option<DateTime<Utc>>,
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Durable map of `client_id -> (rate, capacity)`.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_quota(&self, client_id: &str) -> Result<Option<QuotaRecord>, StorageError>;

    /// Insert a new record, seeding initial state (full bucket, refill from
    /// now) in the same row.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` on a duplicate key.
    async fn create_quota(&self, client_id: &str, quota: QuotaRecord) -> Result<(), StorageError>;

    /// Update rate/capacity only; the current token state is untouched.
    ///
    /// # Errors
    ///
    /// `NotFound` when the client has no record.
    async fn update_quota(&self, client_id: &str, quota: QuotaRecord) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// `NotFound` when the client has no record.
    async fn delete_quota(&self, client_id: &str) -> Result<(), StorageError>;

    /// Whether this store also implements [`StateStore`]. When false the
    /// engine skips all state save/load work.
    fn supports_state_persistence(&self) -> bool {
        false
    }

    /// The state capability, when supported.
    fn state_store(&self) -> Option<&dyn StateStore> {
        None
    }
}

/// Durable map of `client_id -> (tokens, last_refill)`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, client_id: &str) -> Result<Option<SavedState>, StorageError>;

    /// Write every entry in one transaction. Only rows that already exist
    /// are touched; the count of rows actually updated is returned so the
    /// caller can log concurrently-deleted clients.
    async fn batch_update_state(
        &self,
        states: &HashMap<String, SavedState>,
    ) -> Result<usize, StorageError>;
}
