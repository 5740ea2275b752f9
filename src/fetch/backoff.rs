//! Backoff after blocked or failed attempts

use super::{apply_jitter, FetchError, FetchTarget};
use crate::config::BackoffConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Exponent cap for the short backoff; keeps the multiplication finite
const MAX_EXPONENT: u32 = 16;

/// A wall-clock budget shared by everything that sleeps during a run
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Sleeps for `duration`, cut short by `deadline`
///
/// Returns `Err(FetchError::DeadlineExceeded)` if the deadline was already
/// reached or is reached before the sleep completes.
pub async fn sleep_within(duration: Duration, deadline: Option<&Deadline>) -> Result<(), FetchError> {
    let Some(deadline) = deadline else {
        tokio::time::sleep(duration).await;
        return Ok(());
    };

    let remaining = deadline.remaining();
    if remaining.is_zero() {
        return Err(FetchError::DeadlineExceeded);
    }

    if duration < remaining {
        tokio::time::sleep(duration).await;
        Ok(())
    } else {
        tokio::time::sleep(remaining).await;
        Err(FetchError::DeadlineExceeded)
    }
}

/// Computes and applies pauses between failed attempts
///
/// The first failure is treated as a sign the client is flagged and earns a
/// long quarantine; later failures back off exponentially from a shorter
/// base.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    quarantine: Duration,
    short_base: Duration,
    jitter_pct: f64,
}

impl BackoffScheduler {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            quarantine: Duration::from_millis(config.quarantine_ms),
            short_base: Duration::from_millis(config.short_base_ms),
            jitter_pct: config.jitter_pct,
        }
    }

    /// The un-jittered pause for an attempt number
    pub fn base_pause(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.quarantine;
        }

        let exponent = (attempt - 2).min(MAX_EXPONENT);
        self.short_base.saturating_mul(1u32 << exponent)
    }

    /// The jittered pause for an attempt number
    pub fn schedule_pause(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_pause(attempt), self.jitter_pct)
    }

    /// Logs the pause and sleeps through it
    ///
    /// # Returns
    ///
    /// * `Ok(Duration)` - The pause that was slept
    /// * `Err(FetchError::DeadlineExceeded)` - The run deadline cut the pause short
    pub async fn pause(
        &self,
        attempt: u32,
        target: &FetchTarget,
        cause: &FetchError,
        deadline: Option<&Deadline>,
    ) -> Result<Duration, FetchError> {
        let sleep = self.schedule_pause(attempt);

        tracing::warn!(
            action = "pause",
            sleep_ms = sleep.as_millis() as u64,
            attempt,
            url = %target.url,
            status = ?cause.status(),
            reason = %cause.reason(),
            context = %target.context_label(),
            "Backing off before retry"
        );

        sleep_within(sleep, deadline).await?;
        Ok(sleep)
    }
}
