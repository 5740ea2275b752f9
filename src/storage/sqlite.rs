//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.
//! Timestamps are stored as RFC 3339 text and JSON columns as serialized
//! text.

use crate::state::StalenessRecord;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    HealthLogEntry, HealthStatus, NewHealthEntry, NewPendingTask, PendingTask, TaskStatus,
};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;

const RECORD_COLUMNS: &str =
    "identifier, last_synced_at, is_marked_stale, stale_marked_at, terminal_at";

const TASK_COLUMNS: &str = "id, kind, identifier, url, reason, context, attempts, first_seen_at, \
     last_attempt_at, status, completed_at, last_error, result, claimed_at";

const HEALTH_COLUMNS: &str =
    "id, scraper_type, status, duration_ms, items_processed, error_text, meta, created_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;

        // WAL lets a dashboard read while a run writes
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn conversion_error<E>(idx: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(idx, e))
        })
        .transpose()
}

fn optional_json_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| serde_json::from_str(&v).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StalenessRecord> {
    Ok(StalenessRecord {
        identifier: row.get(0)?,
        last_synced_at: timestamp_at(row, 1)?,
        is_marked_stale: row.get(2)?,
        stale_marked_at: optional_timestamp_at(row, 3)?,
        terminal_at: optional_timestamp_at(row, 4)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<PendingTask> {
    Ok(PendingTask {
        id: row.get(0)?,
        kind: row.get(1)?,
        identifier: row.get(2)?,
        url: row.get(3)?,
        reason: row.get(4)?,
        context: optional_json_at(row, 5)?.unwrap_or(serde_json::Value::Null),
        attempts: row.get(6)?,
        first_seen_at: timestamp_at(row, 7)?,
        last_attempt_at: timestamp_at(row, 8)?,
        status: TaskStatus::from_db_string(&row.get::<_, String>(9)?)
            .unwrap_or(TaskStatus::Pending),
        completed_at: optional_timestamp_at(row, 10)?,
        last_error: row.get(11)?,
        result: optional_json_at(row, 12)?,
        claimed_at: optional_timestamp_at(row, 13)?,
    })
}

fn health_from_row(row: &Row<'_>) -> rusqlite::Result<HealthLogEntry> {
    Ok(HealthLogEntry {
        id: row.get(0)?,
        scraper_type: row.get(1)?,
        status: HealthStatus::from_db_string(&row.get::<_, String>(2)?)
            .unwrap_or(HealthStatus::Fail),
        duration_ms: row.get::<_, i64>(3)?.max(0) as u64,
        items_processed: row.get::<_, i64>(4)?.max(0) as u64,
        error_text: row.get(5)?,
        meta: optional_json_at(row, 6)?,
        created_at: timestamp_at(row, 7)?,
    })
}

impl Storage for SqliteStorage {
    // ===== Staleness Records =====

    fn get_record(&self, identifier: &str) -> StorageResult<Option<StalenessRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM staleness_records WHERE identifier = ?1",
                    RECORD_COLUMNS
                ),
                params![identifier],
                record_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn load_records(&self) -> StorageResult<Vec<StalenessRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM staleness_records ORDER BY identifier",
            RECORD_COLUMNS
        ))?;

        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn mark_stale(&mut self, identifier: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let at = at.to_rfc3339();
        self.conn.execute(
            "UPDATE staleness_records
             SET is_marked_stale = 1, stale_marked_at = ?2, updated_at = ?2
             WHERE identifier = ?1",
            params![identifier, at],
        )?;
        Ok(())
    }

    fn mark_synced(
        &mut self,
        identifier: &str,
        at: DateTime<Utc>,
        payload: &serde_json::Value,
        terminal_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        let payload = serde_json::to_string(payload)?;
        self.conn.execute(
            "INSERT INTO staleness_records
                 (identifier, last_synced_at, is_marked_stale, stale_marked_at, terminal_at, payload, updated_at)
             VALUES (?1, ?2, 0, NULL, ?3, ?4, ?2)
             ON CONFLICT(identifier) DO UPDATE SET
                 last_synced_at = excluded.last_synced_at,
                 is_marked_stale = 0,
                 stale_marked_at = NULL,
                 terminal_at = COALESCE(excluded.terminal_at, staleness_records.terminal_at),
                 payload = excluded.payload,
                 updated_at = excluded.updated_at",
            params![
                identifier,
                at.to_rfc3339(),
                terminal_at.map(|t| t.to_rfc3339()),
                payload
            ],
        )?;
        Ok(())
    }

    fn get_payload(&self, identifier: &str) -> StorageResult<Option<serde_json::Value>> {
        let payload: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT payload FROM staleness_records WHERE identifier = ?1",
                params![identifier],
                |row| row.get(0),
            )
            .optional()?;

        match payload.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn count_records(&self) -> StorageResult<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM staleness_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ===== Pending Tasks =====

    fn upsert_pending_task(&mut self, task: &NewPendingTask) -> StorageResult<PendingTask> {
        let now = Utc::now().to_rfc3339();
        let context = serde_json::to_string(&task.context)?;

        let upserted = self.conn.query_row(
            &format!(
                "INSERT INTO pending_tasks
                     (kind, identifier, url, reason, context, attempts, first_seen_at, last_attempt_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6, 'pending')
                 ON CONFLICT(kind, identifier) WHERE status <> 'done' DO UPDATE SET
                     attempts = pending_tasks.attempts + 1,
                     last_attempt_at = excluded.last_attempt_at,
                     url = excluded.url,
                     reason = excluded.reason,
                     context = excluded.context,
                     status = 'pending',
                     completed_at = NULL,
                     last_error = NULL,
                     result = NULL,
                     claimed_at = NULL
                 RETURNING {}",
                TASK_COLUMNS
            ),
            params![
                task.kind,
                task.identifier,
                task.url,
                task.reason,
                context,
                now
            ],
            task_from_row,
        )?;

        Ok(upserted)
    }

    fn get_pending_task(&self, id: i64) -> StorageResult<PendingTask> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM pending_tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_from_row,
            )
            .optional()?
            .ok_or(StorageError::TaskNotFound(id))
    }

    fn list_pending_tasks(
        &self,
        kind: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<PendingTask>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM pending_tasks
             WHERE status = 'pending' AND (?1 IS NULL OR kind = ?1)
             ORDER BY last_attempt_at ASC, id ASC
             LIMIT ?2",
            TASK_COLUMNS
        ))?;

        let tasks = stmt
            .query_map(params![kind, limit as i64], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tasks)
    }

    fn claim_pending_tasks(
        &mut self,
        kind: Option<&str>,
        limit: usize,
        lease: chrono::Duration,
    ) -> StorageResult<Vec<PendingTask>> {
        let now = Utc::now();
        let reclaim_before = (now - lease).to_rfc3339();

        let mut stmt = self.conn.prepare(&format!(
            "UPDATE pending_tasks
             SET attempts = attempts + 1, last_attempt_at = ?3, claimed_at = ?3
             WHERE id IN (
                 SELECT id FROM pending_tasks
                 WHERE status = 'pending' AND (?1 IS NULL OR kind = ?1)
                   AND (claimed_at IS NULL OR julianday(claimed_at) <= julianday(?4))
                 ORDER BY julianday(last_attempt_at) ASC, id ASC
                 LIMIT ?2
             )
             RETURNING {}",
            TASK_COLUMNS
        ))?;

        let mut tasks = stmt
            .query_map(
                params![kind, limit as i64, now.to_rfc3339(), reclaim_before],
                task_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by_key(|task| task.id);

        Ok(tasks)
    }

    fn complete_pending_task(
        &mut self,
        id: i64,
        status: TaskStatus,
        result: Option<&serde_json::Value>,
        last_error: Option<&str>,
    ) -> StorageResult<()> {
        let result = result.map(serde_json::to_string).transpose()?;
        let completed_at = match status {
            TaskStatus::Pending => None,
            TaskStatus::Done | TaskStatus::Failed => Some(Utc::now().to_rfc3339()),
        };

        let updated = self.conn.execute(
            "UPDATE pending_tasks
             SET status = ?2, completed_at = ?3, result = ?4, last_error = ?5
             WHERE id = ?1",
            params![id, status.to_db_string(), completed_at, result, last_error],
        )?;

        if updated == 0 {
            return Err(StorageError::TaskNotFound(id));
        }

        Ok(())
    }

    fn count_open_tasks(&self, kind: &str, identifier: &str) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_tasks
             WHERE kind = ?1 AND identifier = ?2 AND status <> 'done'",
            params![kind, identifier],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ===== Health Log =====

    fn append_health_entry(&mut self, entry: &NewHealthEntry) -> StorageResult<i64> {
        let meta = entry.meta.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO health_log
                 (scraper_type, status, duration_ms, items_processed, error_text, meta, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.scraper_type,
                entry.status.to_db_string(),
                entry.duration_ms as i64,
                entry.items_processed as i64,
                entry.error_text,
                meta,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent_health_entries(
        &self,
        scraper_type: &str,
        limit: usize,
    ) -> StorageResult<Vec<HealthLogEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM health_log WHERE scraper_type = ?1 ORDER BY id DESC LIMIT ?2",
            HEALTH_COLUMNS
        ))?;

        let entries = stmt
            .query_map(params![scraper_type, limit as i64], health_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn health_scraper_types(&self) -> StorageResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT scraper_type FROM health_log ORDER BY scraper_type")?;

        let types = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(types)
    }

    fn count_health_by_status(
        &self,
        scraper_type: &str,
    ) -> StorageResult<HashMap<HealthStatus, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM health_log WHERE scraper_type = ?1 GROUP BY status",
        )?;

        let mut counts = HashMap::new();
        let rows = stmt.query_map(params![scraper_type], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            if let Some(status) = HealthStatus::from_db_string(&status) {
                counts.insert(status, count as u64);
            }
        }

        Ok(counts)
    }
}
