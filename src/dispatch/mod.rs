//! Send dispatch: the single-attempt pipeline and the retry policy the
//! scheduler applies between attempts.

pub mod pipeline;
pub mod retry;

use std::time::Duration;

pub use pipeline::DispatchPipeline;
pub use retry::RetryPolicy;

use crate::limiter::SendFeedback;

/// Outcome of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted by the provider.
    Sent { message_id: Option<String> },
    /// Network error, provider 5xx, or timeout. Retryable.
    Transient(String),
    /// Provider asked us to slow down. Retryable, and narrows throughput.
    Throttled { retry_after: Option<Duration> },
    /// Invalid recipient or a provider-confirmed rejection. Not retryable.
    Permanent(String),
}

impl DispatchOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Throttled { .. })
    }

    /// What the rate limiter learns from this outcome.
    ///
    /// Permanent failures say nothing about provider capacity.
    pub fn feedback(&self) -> Option<SendFeedback> {
        match self {
            Self::Sent { .. } => Some(SendFeedback::Ok),
            Self::Throttled { .. } => Some(SendFeedback::Throttled),
            Self::Transient(_) => Some(SendFeedback::ServerError),
            Self::Permanent(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Transient(_) => "transient",
            Self::Throttled { .. } => "throttled",
            Self::Permanent(_) => "permanent",
        }
    }
}
