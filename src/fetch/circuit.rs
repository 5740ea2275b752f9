//! Block metrics and the block-rate circuit breaker
//!
//! One tracker is shared by every fetch in the process. It counts blocks for
//! reporting and, when too many land inside a sliding window, opens a
//! circuit that makes every strategy either wait or fail until it closes.

use super::{sleep_within, BlockSignal, Deadline, FetchError, Strategy};
use crate::config::{CircuitBreakerConfig, CircuitMode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Cumulative block counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockMetrics {
    pub blocks_total: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub by_kind: BTreeMap<String, u64>,
    /// Keyed by `YYYY-MM-DDTHH` (UTC)
    pub by_hour: BTreeMap<String, u64>,
    /// Keyed by `YYYY-MM-DD` (UTC)
    pub by_day: BTreeMap<String, u64>,
}

/// Serializable view of the tracker, embedded in health entries
#[derive(Debug, Clone, Serialize)]
pub struct BlockSnapshot {
    #[serde(flatten)]
    pub metrics: BlockMetrics,
    pub circuit_open_until: Option<DateTime<Utc>>,
    pub consecutive_429: u32,
}

#[derive(Debug, Default)]
struct TrackerState {
    recent: VecDeque<Instant>,
    consecutive_429: u32,
    open_until: Option<Instant>,
    metrics: BlockMetrics,
}

/// Shared block accounting and circuit breaker
#[derive(Debug)]
pub struct BlockTracker {
    config: CircuitBreakerConfig,
    state: Mutex<TrackerState>,
}

impl BlockTracker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one detected block
    pub fn record_block(&self, strategy: Strategy, signal: &BlockSignal) {
        let mut state = self.lock();
        let now = Utc::now();

        let metrics = &mut state.metrics;
        metrics.blocks_total += 1;
        *metrics.by_reason.entry(signal.reason()).or_default() += 1;
        *metrics.by_kind.entry(strategy.as_str().to_string()).or_default() += 1;
        *metrics
            .by_hour
            .entry(now.format("%Y-%m-%dT%H").to_string())
            .or_default() += 1;
        *metrics
            .by_day
            .entry(now.format("%Y-%m-%d").to_string())
            .or_default() += 1;

        if matches!(signal, BlockSignal::HttpStatus(429)) {
            state.consecutive_429 += 1;
        } else {
            state.consecutive_429 = 0;
        }

        self.note_block(&mut state);

        // A run of 429s counts double toward opening the circuit
        if state.consecutive_429 >= self.config.rate_limit_threshold {
            self.note_block(&mut state);
        }
    }

    /// Records a successful response, ending any run of 429s
    pub fn record_success(&self) {
        self.lock().consecutive_429 = 0;
    }

    fn note_block(&self, state: &mut TrackerState) {
        if !self.config.enabled {
            return;
        }

        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        state.recent.push_back(now);
        while let Some(oldest) = state.recent.front() {
            if now.saturating_duration_since(*oldest) > window {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        if state.recent.len() >= self.config.threshold as usize {
            let until = now + Duration::from_millis(self.config.open_ms);
            if state.open_until.map_or(true, |current| until > current) {
                state.open_until = Some(until);
                tracing::warn!(
                    action = "circuit_open",
                    window_ms = self.config.window_ms,
                    threshold = self.config.threshold,
                    open_ms = self.config.open_ms,
                    "Block rate exceeded, opening circuit"
                );
            }
        }
    }

    /// Time until the circuit closes, if it is open
    pub fn remaining_open(&self) -> Option<Duration> {
        let state = self.lock();
        state
            .open_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Applies the circuit policy before a strategy runs
    ///
    /// In `sleep` mode waits out the open circuit, returning
    /// `FetchError::DeadlineExceeded` if the run deadline expires first. In
    /// `fail-fast` mode returns `FetchError::CircuitOpen` instead.
    pub async fn enforce(
        &self,
        strategy: Strategy,
        url: &str,
        deadline: Option<&Deadline>,
    ) -> Result<(), FetchError> {
        if !self.config.enabled {
            return Ok(());
        }

        let Some(remaining) = self.remaining_open() else {
            return Ok(());
        };

        tracing::warn!(
            action = "circuit_open_block",
            mode = ?self.config.mode,
            remaining_ms = remaining.as_millis() as u64,
            kind = %strategy,
            url,
            "Circuit breaker open"
        );

        match self.config.mode {
            CircuitMode::Sleep => sleep_within(remaining, deadline).await,
            CircuitMode::FailFast => Err(FetchError::CircuitOpen { remaining }),
        }
    }

    /// Snapshot of the counters and circuit state
    pub fn snapshot(&self) -> BlockSnapshot {
        let state = self.lock();
        let circuit_open_until = state
            .open_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
            .and_then(|remaining| chrono::Duration::from_std(remaining).ok())
            .map(|remaining| Utc::now() + remaining);

        BlockSnapshot {
            metrics: state.metrics.clone(),
            circuit_open_until,
            consecutive_429: state.consecutive_429,
        }
    }
}
