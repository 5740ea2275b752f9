use crate::fetch::ContentKind;
use crate::state::StalenessPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for Steady-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default, rename = "circuit-breaker")]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub staleness: StalenessConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub browser: BrowserSettings,
}

/// Describes the data source being kept in sync
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Detail URL with an `{id}` placeholder for the item identifier
    #[serde(rename = "detail-url-template")]
    pub detail_url_template: String,

    /// Identifiers to seed the store with (known records are always included)
    #[serde(default)]
    pub identifiers: Vec<String>,

    /// Task kind used for pending escalations
    #[serde(rename = "task-kind", default = "default_task_kind")]
    pub task_kind: String,

    /// Name under which runs are recorded in the health log
    #[serde(rename = "scraper-type", default = "default_scraper_type")]
    pub scraper_type: String,

    /// Payload kind expected from the detail URL
    #[serde(rename = "expected-kind", default)]
    pub expected_kind: ContentKind,

    /// Payload field holding the item's closing time: a top-level key or a
    /// JSON pointer such as `/Listado/0/FechaCierre`
    #[serde(rename = "terminal-field", default)]
    pub terminal_field: Option<String>,
}

fn default_task_kind() -> String {
    "detail".to_string()
}

fn default_scraper_type() -> String {
    "detail_sync".to_string()
}

impl SourceConfig {
    /// Builds the detail URL for one identifier
    pub fn detail_url(&self, identifier: &str) -> String {
        self.detail_url_template.replace("{id}", identifier)
    }
}

/// Fetch chain configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Lightweight attempts before escalating to the browser
    #[serde(rename = "max-lightweight-attempts")]
    pub max_lightweight_attempts: u32,

    /// Timeout for one lightweight request (milliseconds)
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,

    /// Timeout for one browser navigation (milliseconds)
    #[serde(rename = "browser-timeout-ms")]
    pub browser_timeout_ms: u64,

    /// Accept-Language values rotated across requests
    #[serde(rename = "accept-language")]
    pub accept_language: Vec<String>,

    /// Fixed Referer; derived from the target site when absent
    pub referer: Option<String>,

    /// Fixed Origin; derived from the target site when absent
    pub origin: Option<String>,

    /// Whether exhausted lightweight attempts fall back to the browser
    #[serde(rename = "heavyweight-enabled")]
    pub heavyweight_enabled: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_lightweight_attempts: 5,
            request_timeout_ms: 30_000,
            browser_timeout_ms: 60_000,
            accept_language: vec![
                "es-CL,es;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
                "es-419,es;q=0.9,en;q=0.8".to_string(),
                "es-ES,es;q=0.9,en-US;q=0.7,en;q=0.6".to_string(),
            ],
            referer: None,
            origin: None,
            heavyweight_enabled: true,
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_millis(self.browser_timeout_ms)
    }
}

/// Delay applied after every attempt
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    #[serde(rename = "min-delay-ms")]
    pub min_delay_ms: u64,

    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    #[serde(rename = "jitter-pct")]
    pub jitter_pct: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_delay_ms: 5_000,
            jitter_pct: 0.3,
        }
    }
}

/// Pauses after blocked or failed attempts
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Pause after the first block (milliseconds)
    #[serde(rename = "quarantine-ms")]
    pub quarantine_ms: u64,

    /// Base of the exponential pause from the second attempt on (milliseconds)
    #[serde(rename = "short-base-ms")]
    pub short_base_ms: u64,

    #[serde(rename = "jitter-pct")]
    pub jitter_pct: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            quarantine_ms: 300_000,
            short_base_ms: 30_000,
            jitter_pct: 0.3,
        }
    }
}

/// What the chain does while the circuit is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitMode {
    /// Wait until the circuit closes, then continue
    Sleep,

    /// Fail the attempt immediately
    FailFast,
}

/// Block-rate circuit breaker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Sliding window over which blocks are counted (milliseconds)
    #[serde(rename = "window-ms")]
    pub window_ms: u64,

    /// Blocks within the window that open the circuit
    pub threshold: u32,

    /// How long the circuit stays open (milliseconds)
    #[serde(rename = "open-ms")]
    pub open_ms: u64,

    pub mode: CircuitMode,

    /// Consecutive 429 responses that count as an extra block
    #[serde(rename = "rate-limit-threshold")]
    pub rate_limit_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 5 * 60 * 1000,
            threshold: 3,
            open_ms: 30 * 60 * 1000,
            mode: CircuitMode::Sleep,
            rate_limit_threshold: 3,
        }
    }
}

/// Re-fetch admission windows
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    #[serde(rename = "freshness-window-minutes")]
    pub freshness_window_minutes: i64,

    #[serde(rename = "stale-cooldown-minutes")]
    pub stale_cooldown_minutes: i64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            freshness_window_minutes: 30,
            stale_cooldown_minutes: 60,
        }
    }
}

impl StalenessConfig {
    pub fn policy(&self) -> StalenessPolicy {
        StalenessPolicy {
            freshness_window: chrono::Duration::minutes(self.freshness_window_minutes),
            stale_cooldown: chrono::Duration::minutes(self.stale_cooldown_minutes),
        }
    }
}

/// Fan-out executor settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of concurrent detail fetches
    pub concurrency: usize,

    /// Optional wall-clock budget for a whole run (seconds)
    #[serde(rename = "run-deadline-secs")]
    pub run_deadline_secs: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            run_deadline_secs: None,
        }
    }
}

/// Health log settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that raise an alert
    #[serde(rename = "alert-window")]
    pub alert_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { alert_window: 5 }
    }
}

/// Durable store settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// Heavyweight browser settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Chrome/Chromium binary; auto-detected when absent
    #[serde(rename = "chrome-executable")]
    pub chrome_executable: Option<PathBuf>,

    pub headless: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            headless: true,
        }
    }
}
