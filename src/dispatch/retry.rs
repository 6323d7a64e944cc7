//! Retry policy for transient send failures.
//!
//! Retry timing lives here rather than in the pipeline: the pipeline makes
//! exactly one attempt, and the scheduler gates the next one by setting the
//! record's backoff window from this policy.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Retry ceiling plus exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Transient failures tolerated before the recipient is marked Failed.
    ///
    /// Default: 3
    pub ceiling: u32,

    /// Base delay for exponential backoff (in seconds).
    ///
    /// The delay after the n-th failure is `base * 2^(n - 1)`.
    ///
    /// Default: 300 seconds (5 minutes)
    pub base_delay_secs: u64,

    /// Cap on a single backoff delay (in seconds).
    ///
    /// Default: 86400 seconds (24 hours)
    pub max_delay_secs: u64,

    /// Delay is randomized within ±`jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ceiling: defaults::ceiling(),
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Whether `failure_count` failures exhaust the retry budget.
    #[must_use]
    pub const fn is_exhausted(&self, failure_count: u32) -> bool {
        failure_count >= self.ceiling
    }

    /// Backoff delay after the `failure_count`-th consecutive failure
    /// (1-indexed), before jitter.
    #[must_use]
    pub fn base_backoff(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(32);
        let secs = self
            .base_delay_secs
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_secs);
        capped_seconds(secs)
    }

    /// Longest single backoff this policy allows.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        capped_seconds(self.max_delay_secs)
    }

    /// Backoff delay with jitter applied, never below zero.
    #[must_use]
    pub fn backoff(&self, failure_count: u32) -> Duration {
        let base = self.base_backoff(failure_count);
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        let millis = base.num_milliseconds() as f64 * (1.0 + jitter);
        Duration::milliseconds(millis.max(0.0) as i64)
    }

    /// When the record becomes due again. A provider `Retry-After` hint
    /// pushes the gate further out but never pulls it in, and is capped at
    /// `max_delay_secs` like any other backoff.
    #[must_use]
    pub fn backoff_until(
        &self,
        now: DateTime<Utc>,
        failure_count: u32,
        provider_hint: Option<std::time::Duration>,
    ) -> DateTime<Utc> {
        let mut delay = self.backoff(failure_count);
        if let Some(hint) = provider_hint {
            let hint = Duration::from_std(hint).unwrap_or(Duration::MAX);
            delay = delay.max(hint.min(self.max_delay()));
        }
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn capped_seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

mod defaults {
    pub const fn ceiling() -> u32 {
        3
    }

    pub const fn base_delay_secs() -> u64 {
        300 // 5 minutes
    }

    pub const fn max_delay_secs() -> u64 {
        86400 // 24 hours
    }

    pub const fn jitter_factor() -> f64 {
        0.1 // ±10%
    }
}
