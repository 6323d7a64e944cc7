//! Reply detection: classify inbound mail and halt matching sequences.

pub mod classify;
pub mod detector;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sequence::{RecipientId, StopReason};

pub use classify::{Classification, ReplyClassifier};
pub use detector::{ReplyDetector, SweepReport, spawn_reply_poller};

/// What kind of inbound message a reply is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyClass {
    HumanReply,
    AutoReply,
    /// A bounce naming one of our recipients.
    Undeliverable,
}

impl ReplyClass {
    pub const ALL: [ReplyClass; 3] = [Self::HumanReply, Self::AutoReply, Self::Undeliverable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HumanReply => "human_reply",
            Self::AutoReply => "auto_reply",
            Self::Undeliverable => "undeliverable",
        }
    }

    /// The reason recorded when this class halts a sequence.
    pub fn stop_reason(&self) -> StopReason {
        match self {
            Self::HumanReply => StopReason::ReplyDetected,
            Self::AutoReply => StopReason::AutoReplyDetected,
            Self::Undeliverable => StopReason::PermanentSendFailure,
        }
    }
}

impl fmt::Display for ReplyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown reply class: {s}"))
    }
}

/// Evidence that a known recipient answered. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub recipient: RecipientId,
    pub message_id: String,
    pub class: ReplyClass,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_round_trips_through_str() {
        for class in ReplyClass::ALL {
            assert_eq!(class.as_str().parse::<ReplyClass>().unwrap(), class);
        }
        assert!("spam".parse::<ReplyClass>().is_err());
    }

    #[test]
    fn class_maps_to_terminal_stage() {
        use crate::sequence::Stage;
        assert_eq!(ReplyClass::HumanReply.stop_reason().terminal_stage(), Stage::Replied);
        assert_eq!(ReplyClass::AutoReply.stop_reason().terminal_stage(), Stage::Stopped);
        assert_eq!(ReplyClass::Undeliverable.stop_reason().terminal_stage(), Stage::Failed);
    }
}
