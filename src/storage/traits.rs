//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::state::StalenessRecord;
use crate::storage::{
    HealthLogEntry, HealthStatus, NewHealthEntry, NewPendingTask, PendingTask, TaskStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Pending task not found: {0}")]
    TaskNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// This trait defines all database operations needed by the engine.
/// Writers that must not race (the pending upsert, health appends) are
/// single statements so overlapping runs stay consistent.
pub trait Storage {
    // ===== Staleness Records =====

    /// Gets the staleness record for an item
    fn get_record(&self, identifier: &str) -> StorageResult<Option<StalenessRecord>>;

    /// Loads every staleness record
    fn load_records(&self) -> StorageResult<Vec<StalenessRecord>>;

    /// Sets the stale mark on an existing record
    fn mark_stale(&mut self, identifier: &str, at: DateTime<Utc>) -> StorageResult<()>;

    /// Records a successful sync
    ///
    /// Creates the record on first success. Clears the stale mark, stores
    /// the payload and, when given, updates the terminal time.
    ///
    /// # Arguments
    ///
    /// * `identifier` - The item identifier
    /// * `at` - When the sync completed
    /// * `payload` - The fetched payload
    /// * `terminal_at` - The item's closing time, if the payload carries one
    fn mark_synced(
        &mut self,
        identifier: &str,
        at: DateTime<Utc>,
        payload: &serde_json::Value,
        terminal_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()>;

    /// Gets the last payload stored for an item
    fn get_payload(&self, identifier: &str) -> StorageResult<Option<serde_json::Value>>;

    /// Counts staleness records
    fn count_records(&self) -> StorageResult<u64>;

    // ===== Pending Tasks =====

    /// Inserts a pending task or bumps the open one for the same key
    ///
    /// # Returns
    ///
    /// The open task after the upsert
    fn upsert_pending_task(&mut self, task: &NewPendingTask) -> StorageResult<PendingTask>;

    /// Gets a pending task by ID
    fn get_pending_task(&self, id: i64) -> StorageResult<PendingTask>;

    /// Lists tasks still awaiting resolution, least recently attempted first
    ///
    /// Failed tasks stay open for the key but are not listed until a later
    /// escalation puts them back to pending.
    ///
    /// # Arguments
    ///
    /// * `kind` - Restrict to one task kind, or all kinds when `None`
    /// * `limit` - Maximum number of tasks to return
    fn list_pending_tasks(&self, kind: Option<&str>, limit: usize)
        -> StorageResult<Vec<PendingTask>>;

    /// Claims pending tasks for a resolver
    ///
    /// Claimed tasks get `attempts` bumped and `last_attempt_at` and
    /// `claimed_at` set to now in one statement, so concurrent resolvers
    /// never receive the same task within a lease.
    ///
    /// # Arguments
    ///
    /// * `kind` - Restrict to one task kind, or all kinds when `None`
    /// * `limit` - Maximum number of tasks to claim
    /// * `lease` - How long a claim keeps a task from being handed out again
    ///
    /// # Returns
    ///
    /// The claimed tasks, after the update, in ID order
    fn claim_pending_tasks(
        &mut self,
        kind: Option<&str>,
        limit: usize,
        lease: chrono::Duration,
    ) -> StorageResult<Vec<PendingTask>>;

    /// Resolves a task
    fn complete_pending_task(
        &mut self,
        id: i64,
        status: TaskStatus,
        result: Option<&serde_json::Value>,
        last_error: Option<&str>,
    ) -> StorageResult<()>;

    /// Counts open tasks for a key (0 or 1)
    fn count_open_tasks(&self, kind: &str, identifier: &str) -> StorageResult<u64>;

    // ===== Health Log =====

    /// Appends a health entry and returns its ID
    fn append_health_entry(&mut self, entry: &NewHealthEntry) -> StorageResult<i64>;

    /// Most recent entries for a scraper type, newest first
    fn recent_health_entries(&self, scraper_type: &str, limit: usize)
        -> StorageResult<Vec<HealthLogEntry>>;

    /// Scraper types present in the log
    fn health_scraper_types(&self) -> StorageResult<Vec<String>>;

    /// Entry counts by status for a scraper type
    fn count_health_by_status(&self, scraper_type: &str)
        -> StorageResult<HashMap<HealthStatus, u64>>;
}
