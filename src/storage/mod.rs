//! Storage module for persisting sync data
//!
//! This module handles all database operations for the engine, including:
//! - SQLite database initialization and schema management
//! - Staleness records and last payloads per item
//! - The pending-work escalation queue
//! - The append-only health log

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(HarvestError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, HarvestError> {
    SqliteStorage::new(path)
}

/// Locks a shared store
///
/// A panic in another holder leaves the connection usable, so a poisoned
/// lock is recovered rather than propagated.
pub fn lock_store<S>(store: &Mutex<S>) -> MutexGuard<'_, S> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Status of a pending task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Open tasks still occupy their `(kind, identifier)` key
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Done)
    }
}

/// A unit of work escalated for out-of-band resolution
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub id: i64,
    pub kind: String,
    pub identifier: String,
    pub url: String,
    pub reason: String,
    pub context: serde_json::Value,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,

    /// When a resolver last claimed the task; cleared by a new escalation
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Fields supplied when escalating a task
#[derive(Debug, Clone)]
pub struct NewPendingTask {
    pub kind: String,
    pub identifier: String,
    pub url: String,
    pub reason: String,
    pub context: serde_json::Value,
}

/// Status of a health log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Ok,
    Fail,
    Alert,
}

impl HealthStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Alert => "alert",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "fail" => Some(Self::Fail),
            "alert" => Some(Self::Alert),
            _ => None,
        }
    }
}

/// One row of the health log
#[derive(Debug, Clone)]
pub struct HealthLogEntry {
    pub id: i64,
    pub scraper_type: String,
    pub status: HealthStatus,
    pub duration_ms: u64,
    pub items_processed: u64,
    pub error_text: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when appending to the health log
#[derive(Debug, Clone)]
pub struct NewHealthEntry {
    pub scraper_type: String,
    pub status: HealthStatus,
    pub duration_ms: u64,
    pub items_processed: u64,
    pub error_text: Option<String>,
    pub meta: Option<serde_json::Value>,
}
