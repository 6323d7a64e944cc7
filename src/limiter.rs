//! Adaptive send-rate limiting.
//!
//! Two independent budgets guard outbound sends:
//!
//! - a rolling per-minute window, whose ceiling adapts to provider feedback
//! - a per-day window, fixed at its configured maximum
//!
//! # Adaptive ceiling (AIMD)
//!
//! ```text
//! Throttled   -> effective = max(1, effective * decrease_factor), cooldown starts
//! cooldown    -> no recovery until it elapses
//! OK for a full recovery interval -> effective += increase_step (<= max)
//! ServerError -> recovery progress restarts, ceiling unchanged
//! ```
//!
//! All state sits behind one `parking_lot::Mutex`; every operation is O(1)
//! amortized and never touches I/O.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest cooldown or recovery interval the limiter honours.
pub const MAX_INTERVAL: Duration = DAY;

/// Configuration for the limiter.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Configured (maximum) sends per rolling minute.
    pub per_minute: u32,
    /// Sends per day.
    pub per_day: u32,
    /// How long OK outcomes must be sustained before each increase.
    pub recovery_interval: Duration,
    /// Quiet period after a throttle signal before recovery may start.
    pub cooldown: Duration,
    pub increase_step: u32,
    pub decrease_factor: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            per_minute: 30,
            per_day: 10_000,
            recovery_interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(120),
            increase_step: 1,
            decrease_factor: 0.5,
        }
    }
}

/// Result of `try_acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Denied { retry_after: Duration },
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Provider feedback for a completed send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFeedback {
    Ok,
    Throttled,
    ServerError,
}

/// Point-in-time view of the limiter for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    pub minute_count: u32,
    pub day_count: u32,
    pub effective_per_minute: u32,
    pub configured_per_minute: u32,
    pub per_day: u32,
    pub cooling_down: bool,
}

#[derive(Debug)]
struct LimiterState {
    /// Grant instants inside the current rolling minute, oldest first.
    minute_log: VecDeque<Instant>,
    day_started: Instant,
    day_count: u32,
    effective_per_minute: u32,
    cooldown_until: Option<Instant>,
    /// Start of the current run of OK outcomes counted toward recovery.
    ok_since: Option<Instant>,
}

impl LimiterState {
    fn roll_windows(&mut self, now: Instant) {
        while let Some(&oldest) = self.minute_log.front() {
            if now.saturating_duration_since(oldest) >= MINUTE {
                self.minute_log.pop_front();
            } else {
                break;
            }
        }

        if now.saturating_duration_since(self.day_started) >= DAY {
            self.day_started = now;
            self.day_count = 0;
        }
    }

    fn minute_count(&self) -> u32 {
        u32::try_from(self.minute_log.len()).unwrap_or(u32::MAX)
    }
}

/// Dual-window adaptive rate limiter. Shared by reference between the
/// scheduler and its in-flight sends.
#[derive(Debug)]
pub struct RateLimiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: LimiterConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    fn new_at(config: LimiterConfig, now: Instant) -> Self {
        let state = LimiterState {
            minute_log: VecDeque::new(),
            day_started: now,
            day_count: 0,
            effective_per_minute: config.per_minute.max(1),
            cooldown_until: None,
            ok_since: None,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Take one send from both budgets, or report how long until one frees up.
    pub fn try_acquire(&self) -> Acquire {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Acquire {
        let mut state = self.state.lock();
        state.roll_windows(now);

        let minute_full = state.minute_count() >= state.effective_per_minute;
        let day_full = state.day_count >= self.config.per_day;

        if !minute_full && !day_full {
            state.minute_log.push_back(now);
            state.day_count += 1;
            return Acquire::Granted;
        }

        let minute_wait = minute_full.then(|| {
            // The window frees a slot once enough of the oldest grants expire
            // to bring the count under the (possibly shrunk) ceiling.
            let excess = state.minute_count() - state.effective_per_minute;
            state
                .minute_log
                .get(excess as usize)
                .map_or(MINUTE, |&granted| {
                    (granted + MINUTE).saturating_duration_since(now)
                })
        });
        let day_wait =
            day_full.then(|| (state.day_started + DAY).saturating_duration_since(now));

        let retry_after = match (minute_wait, day_wait) {
            (Some(m), Some(d)) => m.min(d),
            (Some(wait), None) | (None, Some(wait)) => wait,
            (None, None) => Duration::ZERO,
        };
        drop(state);

        tracing::debug!(
            retry_after_secs = retry_after.as_secs_f64(),
            minute_full,
            day_full,
            "Send budget exhausted"
        );
        Acquire::Denied {
            retry_after: retry_after.max(Duration::from_millis(1)),
        }
    }

    /// Feed a send outcome back into the adaptive ceiling.
    pub fn report(&self, feedback: SendFeedback) {
        self.report_at(feedback, Instant::now());
    }

    pub fn report_at(&self, feedback: SendFeedback, now: Instant) {
        let mut state = self.state.lock();
        match feedback {
            SendFeedback::Throttled => {
                let before = state.effective_per_minute;
                let shrunk = (f64::from(before) * self.config.decrease_factor).floor() as u32;
                state.effective_per_minute = shrunk.clamp(1, before.max(1));
                if state.effective_per_minute == before && before > 1 {
                    state.effective_per_minute = before - 1;
                }
                let cooldown = self.config.cooldown.min(MAX_INTERVAL);
                state.cooldown_until = Some(now.checked_add(cooldown).unwrap_or(now));
                state.ok_since = None;
                tracing::warn!(
                    from = before,
                    to = state.effective_per_minute,
                    "Provider throttled sends, shrinking per-minute ceiling"
                );
            }
            SendFeedback::ServerError => {
                state.ok_since = Some(now);
            }
            SendFeedback::Ok => {
                if state.effective_per_minute >= self.config.per_minute {
                    return;
                }
                if state.cooldown_until.is_some_and(|until| now < until) {
                    return;
                }
                let start = state
                    .ok_since
                    .or(state.cooldown_until)
                    .unwrap_or(now);
                if now.saturating_duration_since(start) >= self.config.recovery_interval {
                    let raised = state
                        .effective_per_minute
                        .saturating_add(self.config.increase_step.max(1))
                        .min(self.config.per_minute);
                    tracing::info!(
                        from = state.effective_per_minute,
                        to = raised,
                        "Recovering per-minute ceiling"
                    );
                    state.effective_per_minute = raised;
                    state.ok_since = Some(now);
                } else {
                    state.ok_since = Some(start);
                }
            }
        }
    }

    pub fn effective_per_minute(&self) -> u32 {
        self.state.lock().effective_per_minute
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> LimiterSnapshot {
        let mut state = self.state.lock();
        state.roll_windows(now);
        LimiterSnapshot {
            minute_count: state.minute_count(),
            day_count: state.day_count,
            effective_per_minute: state.effective_per_minute,
            configured_per_minute: self.config.per_minute,
            per_day: self.config.per_day,
            cooling_down: state.cooldown_until.is_some_and(|until| now < until),
        }
    }
}
