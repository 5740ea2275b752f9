//! Steady-Harvest: a resilient acquisition engine
//!
//! This crate keeps a local store of structured records in sync with a
//! rate-limited, anti-bot-protected public data source. Each run decides
//! which items are due for a refresh, fans detail fetches out under a
//! concurrency cap, escalates from plain HTTP to a real browser when
//! requests get blocked, queues unrecoverable items for out-of-band
//! resolution and records the run's health.

pub mod config;
pub mod escalation;
pub mod fetch;
pub mod health;
pub mod schedule;
pub mod state;
pub mod storage;
pub mod sync;

use thiserror::Error;

/// Main error type for Steady-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] fetch::FetchError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Invalid target for {identifier}: {message}")]
    InvalidTarget { identifier: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Steady-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use fetch::{FetchError, FetchOutcome, FetchTarget, ResilientFetcher};
pub use state::{admit_for_fetch, Admission, ItemState, StalenessRecord};
pub use sync::{run_sync, RunSummary, SyncRun};
