//! Configuration module for Steady-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use steady_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Fan-out limit: {}", config.executor.concurrency);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BackoffConfig, BrowserSettings, CircuitBreakerConfig, CircuitMode, Config, ExecutorConfig,
    FetchConfig, HealthConfig, PacingConfig, SourceConfig, StalenessConfig, StorageConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
