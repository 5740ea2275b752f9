//! Inter-request pacing

use crate::config::PacingConfig;
use rand::Rng;
use std::time::Duration;

/// Randomizes a base duration by up to `jitter_pct` in either direction
///
/// The result is uniform in `[base - base*pct, base + base*pct]`, with `pct`
/// clamped to `[0, 1]` and the result floored at zero.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use steady_harvest::fetch::apply_jitter;
///
/// let jittered = apply_jitter(Duration::from_millis(1000), 0.3);
/// assert!(jittered >= Duration::from_millis(700));
/// assert!(jittered <= Duration::from_millis(1300));
/// ```
pub fn apply_jitter(base: Duration, jitter_pct: f64) -> Duration {
    let base_ms = base.as_millis() as f64;
    if base_ms <= 0.0 {
        return Duration::ZERO;
    }

    let pct = if jitter_pct.is_nan() {
        0.0
    } else {
        jitter_pct.clamp(0.0, 1.0)
    };
    let delta = base_ms * pct;

    let offset = if delta > 0.0 {
        rand::thread_rng().gen_range(-delta..=delta)
    } else {
        0.0
    };

    Duration::from_millis((base_ms + offset).max(0.0).round() as u64)
}

/// Enforces a randomized minimum gap after every fetch attempt
#[derive(Debug, Clone)]
pub struct RatePacer {
    min_delay: Duration,
    max_delay: Duration,
    jitter_pct: f64,
}

impl RatePacer {
    pub fn new(config: &PacingConfig) -> Self {
        let min_delay = Duration::from_millis(config.min_delay_ms);
        let max_delay = Duration::from_millis(config.max_delay_ms.max(config.min_delay_ms));

        Self {
            min_delay,
            max_delay,
            jitter_pct: config.jitter_pct,
        }
    }

    /// Draws the next delay: uniform between min and max, then jittered
    pub fn next_delay(&self) -> Duration {
        let min_ms = self.min_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let base_ms = if max_ms > min_ms {
            rand::thread_rng().gen_range(min_ms..=max_ms)
        } else {
            min_ms
        };

        apply_jitter(Duration::from_millis(base_ms), self.jitter_pct)
    }

    /// Sleeps for the next delay and returns how long it slept
    pub async fn pace(&self) -> Duration {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tracing::trace!(delay_ms = delay.as_millis() as u64, "Pacing before next request");
            tokio::time::sleep(delay).await;
        }
        delay
    }
}
