//! Stage timing and which stages are enabled.

use chrono::{DateTime, Duration, Utc};

use crate::sequence::model::Stage;

/// What happens when a due recipient is picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Send email `index` (0 = initial) and advance to `advance_to`.
    Send { index: u8, advance_to: Stage },
    /// No further emails are configured; the sequence ends.
    Complete,
}

/// Per-stage delays. `delay_after(S)` is the gap between the send that
/// produced `S` and the next step.
#[derive(Debug, Clone)]
pub struct SequencePlan {
    /// Gap between enrolment and the initial send.
    pub initial_delay: Duration,
    pub follow_up_1_delay: Duration,
    pub follow_up_2_enabled: bool,
    pub follow_up_2_delay: Duration,
    /// How long to wait for a reply after the last email before completing.
    pub completion_window: Duration,
}

impl Default for SequencePlan {
    fn default() -> Self {
        Self {
            initial_delay: Duration::seconds(60),
            follow_up_1_delay: Duration::days(14),
            follow_up_2_enabled: true,
            follow_up_2_delay: Duration::days(10),
            completion_window: Duration::days(10),
        }
    }
}

impl SequencePlan {
    /// Delay following the send that produced `stage`.
    ///
    /// After follow-up 1 the follow-up 2 delay is the reply window whether or
    /// not follow-up 2 is enabled.
    pub fn delay_after(&self, stage: Stage) -> Duration {
        match stage {
            Stage::NotStarted => self.initial_delay,
            Stage::InitialSent => self.follow_up_1_delay,
            Stage::FollowUp1Sent => self.follow_up_2_delay,
            Stage::FollowUp2Sent => self.completion_window,
            Stage::Replied | Stage::Stopped | Stage::Failed => Duration::zero(),
        }
    }

    /// `next_eligible_at` for a record that just reached `stage` at `sent_at`.
    pub fn next_eligible_at(&self, stage: Stage, sent_at: DateTime<Utc>) -> DateTime<Utc> {
        sent_at + self.delay_after(stage)
    }

    /// The step a due recipient at `stage` takes, or `None` when terminal.
    pub fn next_step(&self, stage: Stage) -> Option<NextStep> {
        match stage {
            Stage::NotStarted => Some(NextStep::Send {
                index: 0,
                advance_to: Stage::InitialSent,
            }),
            Stage::InitialSent => Some(NextStep::Send {
                index: 1,
                advance_to: Stage::FollowUp1Sent,
            }),
            Stage::FollowUp1Sent if self.follow_up_2_enabled => Some(NextStep::Send {
                index: 2,
                advance_to: Stage::FollowUp2Sent,
            }),
            Stage::FollowUp1Sent | Stage::FollowUp2Sent => Some(NextStep::Complete),
            Stage::Replied | Stage::Stopped | Stage::Failed => None,
        }
    }

    /// Number of emails a full sequence sends.
    pub fn email_count(&self) -> u8 {
        if self.follow_up_2_enabled { 3 } else { 2 }
    }
}
