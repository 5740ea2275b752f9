//! Fetch layer: everything between a target URL and a parsed payload
//!
//! This module contains the acquisition core, including:
//! - Block classification of responses
//! - Inter-request pacing and block backoff
//! - Realistic request headers
//! - The lightweight (HTTP) and heavyweight (browser) strategies
//! - The fallback chain that ties them together

mod backoff;
mod browser;
mod chain;
mod circuit;
mod classifier;
mod headers;
mod pacer;
mod transport;

pub use backoff::{sleep_within, BackoffScheduler, Deadline};
pub use browser::{
    BrowserError, BrowserHandle, BrowserLauncher, BrowserPage, BrowserSession, ChromiumLauncher,
};
pub use chain::ResilientFetcher;
pub use circuit::{BlockSnapshot, BlockTracker};
pub use classifier::{classify, classify_malformed, looks_like_markup, BlockVerdict, ResponseView};
pub use headers::{random_user_agent, HeaderProfile, USER_AGENTS};
pub use pacer::{apply_jitter, RatePacer};
pub use transport::{build_http_client, HttpTransport, Transport, TransportError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HTTP statuses that are treated as retryable without being a block.
///
/// 403, 429 and 504 never reach this check as plain HTTP errors because the
/// classifier already turns them into blocks.
pub const RETRYABLE_HTTP_STATUSES: [u16; 6] = [403, 408, 429, 502, 503, 504];

/// Maximum number of body characters kept in error messages
const BODY_EXCERPT_LEN: usize = 500;

/// The payload kind a caller expects from a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Structured JSON; markup responses are anomalous
    #[default]
    Json,

    /// Any textual body
    Text,
}

/// Which fetch strategy produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Lightweight,
    Heavyweight,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lightweight => "lightweight",
            Self::Heavyweight => "heavyweight",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request to be pushed through the fetch chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    /// Absolute URL to fetch
    pub url: String,

    /// Free-form tags (phase, identifiers) carried into logs and escalations
    pub context: BTreeMap<String, String>,

    /// What the payload is expected to be
    pub expected_kind: ContentKind,
}

impl FetchTarget {
    /// Creates a JSON target with an empty context
    pub fn json(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            context: BTreeMap::new(),
            expected_kind: ContentKind::Json,
        }
    }

    /// Adds a context tag
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Renders the context as `key=value` pairs for log lines
    pub fn context_label(&self) -> String {
        self.context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A response as seen by the classifier, independent of the strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Why a response was judged to be a block rather than an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BlockSignal {
    /// One of the block status codes (403, 429, 504)
    HttpStatus(u16),

    /// A markup body carrying a known challenge signature
    ChallengeBody(String),

    /// Markup where structured data was expected, with no known signature
    UnexpectedContentType,
}

impl BlockSignal {
    /// Stable string form used in logs, metrics and escalation reasons
    pub fn reason(&self) -> String {
        match self {
            Self::HttpStatus(status) => format!("http_{}", status),
            Self::ChallengeBody(signature) => signature.clone(),
            Self::UnexpectedContentType => "unexpected_markup".to_string(),
        }
    }
}

impl fmt::Display for BlockSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

/// Result of one successful (or failed) traversal of the fetch chain
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub succeeded: bool,
    pub payload: Option<serde_json::Value>,
    pub block_signal: Option<BlockSignal>,
    pub http_status: Option<u16>,
    pub latency: Duration,
    pub attempts_used: u32,
    pub strategy_used: Strategy,
}

impl FetchOutcome {
    /// Builds the outcome of a successful fetch
    pub fn success(
        payload: serde_json::Value,
        http_status: u16,
        strategy_used: Strategy,
        attempts_used: u32,
        latency: Duration,
    ) -> Self {
        Self {
            succeeded: true,
            payload: Some(payload),
            block_signal: None,
            http_status: Some(http_status),
            latency,
            attempts_used,
            strategy_used,
        }
    }

    /// Builds the outcome of a failed fetch from its terminal error
    pub fn failure(error: &FetchError, latency: Duration) -> Self {
        Self {
            succeeded: false,
            payload: None,
            block_signal: error.block_signal().cloned(),
            http_status: error.status(),
            latency,
            attempts_used: error.attempts().unwrap_or(1),
            strategy_used: error.strategy().unwrap_or(Strategy::Lightweight),
        }
    }
}

/// Errors produced while fetching a target
///
/// Retryability is an explicit property of each variant (see
/// [`FetchError::is_retryable`]); only `Exhausted`, non-retryable `Http`
/// and `DeadlineExceeded` ever leave [`ResilientFetcher::resilient_fetch`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Block detected for {url} (HTTP {status}): {signal}")]
    Block {
        url: String,
        status: u16,
        signal: BlockSignal,
    },

    #[error("Request timeout for {url}")]
    Timeout { url: String },

    #[error("HTTP {status} for {url}: {body_excerpt}")]
    Http {
        url: String,
        status: u16,
        body_excerpt: String,
    },

    #[error("Unexpected non-JSON payload from {url}: {message}")]
    Parse { url: String, message: String },

    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Browser error for {url}: {message}")]
    Browser { url: String, message: String },

    #[error("Circuit breaker open ({}s remaining)", remaining.as_secs())]
    CircuitOpen { remaining: Duration },

    #[error("Run deadline exceeded")]
    DeadlineExceeded,

    #[error("All fetch strategies exhausted for {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        /// Last strategy the chain tried
        strategy: Strategy,
        attempts: u32,
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether the chain may absorb this error and try again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Block { .. }
            | Self::Timeout { .. }
            | Self::Parse { .. }
            | Self::Transport { .. }
            | Self::Browser { .. }
            | Self::CircuitOpen { .. } => true,
            Self::Http { status, .. } => is_retryable_status(*status),
            Self::DeadlineExceeded | Self::Exhausted { .. } => false,
        }
    }

    /// Terminal classification: "block", "timeout" or "other"
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Block { .. } => "block",
            Self::Timeout { .. } => "timeout",
            Self::Exhausted { last, .. } => last.kind(),
            _ => "other",
        }
    }

    /// The block signal behind this error, if any
    pub fn block_signal(&self) -> Option<&BlockSignal> {
        match self {
            Self::Block { signal, .. } => Some(signal),
            Self::Exhausted { last, .. } => last.block_signal(),
            _ => None,
        }
    }

    /// The HTTP status behind this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Block { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::Exhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Attempts spent, when the error carries that information
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Last strategy tried, when the error carries that information
    pub fn strategy(&self) -> Option<Strategy> {
        match self {
            Self::Exhausted { strategy, .. } => Some(*strategy),
            _ => None,
        }
    }

    /// Short reason string for logs and escalation rows
    pub fn reason(&self) -> String {
        match self {
            Self::Block { signal, .. } => signal.reason(),
            Self::Timeout { .. } => "timeout".to_string(),
            Self::Http { status, .. } => format!("http_{}", status),
            Self::Parse { .. } => "parse_error".to_string(),
            Self::Transport { .. } => "transport_error".to_string(),
            Self::Browser { .. } => "browser_error".to_string(),
            Self::CircuitOpen { .. } => "circuit_open".to_string(),
            Self::DeadlineExceeded => "deadline_exceeded".to_string(),
            Self::Exhausted { last, .. } => format!("exhausted:{}", last.reason()),
        }
    }

    pub(crate) fn from_transport(url: &str, error: TransportError) -> Self {
        match error {
            TransportError::Timeout => Self::Timeout {
                url: url.to_string(),
            },
            other => Self::Transport {
                url: url.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn from_browser(url: &str, error: BrowserError) -> Self {
        match error {
            BrowserError::Timeout(_) => Self::Timeout {
                url: url.to_string(),
            },
            other => Self::Browser {
                url: url.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Retry policy for plain (non-block) HTTP errors
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_HTTP_STATUSES.contains(&status)
}

/// Truncates a body for inclusion in error messages
pub(crate) fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_LEN).collect()
}
