//! Health statistics from the health log
//!
//! This module provides functionality for summarizing and displaying the
//! health log per scraper type.

use crate::storage::{HealthLogEntry, HealthStatus, Storage, StorageResult};
use std::collections::HashMap;

/// Health summary for one scraper type
#[derive(Debug, Clone)]
pub struct ScraperHealth {
    pub scraper_type: String,

    /// Count of entries by status
    pub counts: HashMap<HealthStatus, u64>,

    /// Most recent entries, newest first
    pub recent: Vec<HealthLogEntry>,
}

impl ScraperHealth {
    /// Number of failures since the last successful run
    pub fn current_failure_streak(&self) -> usize {
        self.recent
            .iter()
            .take_while(|entry| entry.status != HealthStatus::Ok)
            .filter(|entry| entry.status == HealthStatus::Fail)
            .count()
    }

    /// Total runs recorded (alerts are derived rows, not runs)
    pub fn total_runs(&self) -> u64 {
        self.count(HealthStatus::Ok) + self.count(HealthStatus::Fail)
    }

    pub fn count(&self, status: HealthStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

/// Health summary across scraper types
#[derive(Debug, Clone, Default)]
pub struct HealthStatistics {
    pub scrapers: Vec<ScraperHealth>,
}

/// Loads health statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
/// * `recent_limit` - How many recent entries to keep per scraper type
///
/// # Returns
///
/// * `Ok(HealthStatistics)` - Successfully loaded statistics
/// * `Err(StorageError)` - Failed to query statistics
pub fn load_statistics(
    storage: &dyn Storage,
    recent_limit: usize,
) -> StorageResult<HealthStatistics> {
    let mut scrapers = Vec::new();

    for scraper_type in storage.health_scraper_types()? {
        let counts = storage.count_health_by_status(&scraper_type)?;
        let recent = storage.recent_health_entries(&scraper_type, recent_limit)?;
        scrapers.push(ScraperHealth {
            scraper_type,
            counts,
            recent,
        });
    }

    Ok(HealthStatistics { scrapers })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &HealthStatistics) {
    println!("=== Health Statistics ===\n");

    if stats.scrapers.is_empty() {
        println!("No runs recorded yet.");
        return;
    }

    for scraper in &stats.scrapers {
        let total = scraper.total_runs();
        let ok = scraper.count(HealthStatus::Ok);
        let success_rate = if total > 0 {
            (ok as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        println!("{}:", scraper.scraper_type);
        println!(
            "  Runs: {} ok, {} failed ({:.1}% success)",
            ok,
            scraper.count(HealthStatus::Fail),
            success_rate
        );
        println!("  Alerts raised: {}", scraper.count(HealthStatus::Alert));
        println!("  Current failure streak: {}", scraper.current_failure_streak());

        if !scraper.recent.is_empty() {
            println!("  Recent entries:");
            for entry in &scraper.recent {
                println!(
                    "    #{} {} {:<5} {:>7}ms {:>4} items {}",
                    entry.id,
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.status.to_db_string(),
                    entry.duration_ms,
                    entry.items_processed,
                    entry.error_text.as_deref().unwrap_or("")
                );
            }
        }
        println!();
    }
}
