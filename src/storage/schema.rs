//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Steady-Harvest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Sync history per item, with the last payload fetched for it
CREATE TABLE IF NOT EXISTS staleness_records (
    identifier TEXT PRIMARY KEY,
    last_synced_at TEXT NOT NULL,
    is_marked_stale INTEGER NOT NULL DEFAULT 0,
    stale_marked_at TEXT,
    terminal_at TEXT,
    payload TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staleness_terminal ON staleness_records(terminal_at);

-- Items that every fetch strategy failed on, awaiting out-of-band resolution
CREATE TABLE IF NOT EXISTS pending_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    identifier TEXT NOT NULL,
    url TEXT NOT NULL,
    reason TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT '{}',
    attempts INTEGER NOT NULL DEFAULT 1,
    first_seen_at TEXT NOT NULL,
    last_attempt_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    completed_at TEXT,
    last_error TEXT,
    result TEXT,
    claimed_at TEXT
);

-- At most one open (not done) task per key
CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_open
    ON pending_tasks(kind, identifier) WHERE status <> 'done';
CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_tasks(status, last_attempt_at);

-- Append-only log of run outcomes and derived alerts
CREATE TABLE IF NOT EXISTS health_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scraper_type TEXT NOT NULL,
    status TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    items_processed INTEGER NOT NULL DEFAULT 0,
    error_text TEXT,
    meta TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_health_scraper ON health_log(scraper_type, id);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
