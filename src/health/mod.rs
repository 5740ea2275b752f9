//! Health recording and consecutive-failure alerting
//!
//! Every run appends one entry to the health log. A full window of
//! consecutive failures for a scraper type derives an `alert` entry.
//! Recording is best-effort: store errors are logged and swallowed so a
//! broken health log never fails a run.

mod stats;

pub use stats::{load_statistics, print_statistics, HealthStatistics, ScraperHealth};

use crate::storage::{
    lock_store, HealthLogEntry, HealthStatus, NewHealthEntry, Storage, StorageResult,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Outcome of one run, as handed to the recorder
#[derive(Debug, Clone)]
pub struct RunReport {
    pub scraper_type: String,
    pub status: HealthStatus,
    pub duration_ms: u64,
    pub items_processed: u64,
    pub error_text: Option<String>,
    pub meta: Option<serde_json::Value>,
}

impl RunReport {
    pub fn ok(scraper_type: &str, duration_ms: u64, items_processed: u64) -> Self {
        Self {
            scraper_type: scraper_type.to_string(),
            status: HealthStatus::Ok,
            duration_ms,
            items_processed,
            error_text: None,
            meta: None,
        }
    }

    pub fn fail(scraper_type: &str, duration_ms: u64, error_text: impl Into<String>) -> Self {
        Self {
            scraper_type: scraper_type.to_string(),
            status: HealthStatus::Fail,
            duration_ms,
            items_processed: 0,
            error_text: Some(error_text.into()),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Appends run outcomes and raises alerts
pub struct HealthRecorder<S: Storage> {
    store: Arc<Mutex<S>>,
    alert_window: usize,
}

impl<S: Storage> HealthRecorder<S> {
    /// Creates a recorder
    ///
    /// # Arguments
    ///
    /// * `store` - The shared store holding the health log
    /// * `alert_window` - Consecutive failures that raise an alert
    pub fn new(store: Arc<Mutex<S>>, alert_window: usize) -> Self {
        Self {
            store,
            alert_window: alert_window.max(1),
        }
    }

    pub fn alert_window(&self) -> usize {
        self.alert_window
    }

    /// Records a run outcome
    ///
    /// # Returns
    ///
    /// * `Some(status)` - Status of the last entry written (`Alert` when the
    ///   failure completed an alert window)
    /// * `None` - The store rejected the write; the error was logged
    pub fn record_run(&self, report: &RunReport) -> Option<HealthStatus> {
        match self.append(report) {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(
                    scraper_type = %report.scraper_type,
                    status = report.status.to_db_string(),
                    "Failed to record run health: {}",
                    e
                );
                None
            }
        }
    }

    fn append(&self, report: &RunReport) -> StorageResult<HealthStatus> {
        // Held across the read-back so the window is not interleaved
        let mut store = lock_store(&self.store);

        store.append_health_entry(&NewHealthEntry {
            scraper_type: report.scraper_type.clone(),
            status: report.status,
            duration_ms: report.duration_ms,
            items_processed: report.items_processed,
            error_text: report.error_text.clone(),
            meta: report.meta.clone(),
        })?;

        if report.status != HealthStatus::Fail {
            return Ok(report.status);
        }

        let window = store.recent_health_entries(&report.scraper_type, self.alert_window)?;
        if window.len() < self.alert_window
            || window.iter().any(|entry| entry.status != HealthStatus::Fail)
        {
            return Ok(HealthStatus::Fail);
        }

        let alert = alert_entry(&report.scraper_type, &window);
        let alert_id = store.append_health_entry(&alert)?;

        tracing::error!(
            action = "alert",
            scraper_type = %report.scraper_type,
            alert_id,
            consecutive_failures = window.len(),
            "{}",
            alert.error_text.as_deref().unwrap_or_default()
        );

        Ok(HealthStatus::Alert)
    }
}

/// Builds the alert entry for a window of failures (newest first)
fn alert_entry(scraper_type: &str, window: &[HealthLogEntry]) -> NewHealthEntry {
    let ids: Vec<i64> = window.iter().rev().map(|entry| entry.id).collect();
    let last_error = window.first().and_then(|entry| entry.error_text.clone());

    NewHealthEntry {
        scraper_type: scraper_type.to_string(),
        status: HealthStatus::Alert,
        duration_ms: 0,
        items_processed: 0,
        error_text: Some(format!(
            "{} consecutive failed runs for {}",
            window.len(),
            scraper_type
        )),
        meta: Some(json!({
            "consecutive_failures": window.len(),
            "first_entry_id": ids.first(),
            "last_entry_id": ids.last(),
            "entry_ids": ids,
            "last_error": last_error,
        })),
    }
}
