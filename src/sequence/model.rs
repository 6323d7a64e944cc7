//! Recipient sequence state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable recipient key: the trimmed, lowercased email address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    pub fn new(email: &str) -> Self {
        Self(email.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Basic shape check: one `@` with something on both sides.
    pub fn is_valid(&self) -> bool {
        match self.0.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && !domain.is_empty() && !domain.contains('@')
            }
            None => false,
        }
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a recipient in their sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    InitialSent,
    #[serde(rename = "follow_up_1_sent")]
    FollowUp1Sent,
    #[serde(rename = "follow_up_2_sent")]
    FollowUp2Sent,
    Replied,
    Stopped,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::NotStarted,
        Stage::InitialSent,
        Stage::FollowUp1Sent,
        Stage::FollowUp2Sent,
        Stage::Replied,
        Stage::Stopped,
        Stage::Failed,
    ];

    /// Terminal states are absorbing: no further sends, no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Replied | Self::Stopped | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Rank along the forward path; `None` for terminal states.
    fn forward_rank(&self) -> Option<u8> {
        match self {
            Self::NotStarted => Some(0),
            Self::InitialSent => Some(1),
            Self::FollowUp1Sent => Some(2),
            Self::FollowUp2Sent => Some(3),
            Self::Replied | Self::Stopped | Self::Failed => None,
        }
    }

    /// Forward progress moves exactly one step; any active state may jump
    /// to any terminal state; terminal states never move.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        match (self.forward_rank(), target.forward_rank()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(from), Some(to)) => to == from + 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InitialSent => "initial_sent",
            Self::FollowUp1Sent => "follow_up_1_sent",
            Self::FollowUp2Sent => "follow_up_2_sent",
            Self::Replied => "replied",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Why a recipient's sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ManualStop,
    ReplyDetected,
    AutoReplyDetected,
    PermanentSendFailure,
    RetriesExhausted,
    SequenceComplete,
}

impl StopReason {
    pub const ALL: [StopReason; 6] = [
        StopReason::ManualStop,
        StopReason::ReplyDetected,
        StopReason::AutoReplyDetected,
        StopReason::PermanentSendFailure,
        StopReason::RetriesExhausted,
        StopReason::SequenceComplete,
    ];

    /// The terminal stage a record lands in for this reason.
    pub fn terminal_stage(&self) -> Stage {
        match self {
            Self::ReplyDetected => Stage::Replied,
            Self::ManualStop | Self::AutoReplyDetected | Self::SequenceComplete => Stage::Stopped,
            Self::PermanentSendFailure | Self::RetriesExhausted => Stage::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualStop => "manual_stop",
            Self::ReplyDetected => "reply_detected",
            Self::AutoReplyDetected => "auto_reply_detected",
            Self::PermanentSendFailure => "permanent_send_failure",
            Self::RetriesExhausted => "retries_exhausted",
            Self::SequenceComplete => "sequence_complete",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| format!("unknown stop reason: {s}"))
    }
}

/// A single template variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<f64> for AttributeValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

/// Opaque per-recipient template variables.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// One recipient's durable sequence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub id: RecipientId,
    pub stage: Stage,
    /// When the last email was sent; `None` while `NotStarted`.
    pub stage_sent_at: Option<DateTime<Utc>>,
    /// Earliest time the next step may run.
    pub next_eligible_at: DateTime<Utc>,
    /// Transient failures since the last successful send.
    pub retry_count: u32,
    /// Backoff gate after a transient failure. Never moves `next_eligible_at`.
    pub backoff_until: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    /// Provider message id of the last send, when the provider returns one.
    pub last_message_id: Option<String>,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecipientRecord {
    /// A fresh `NotStarted` record, first eligible at `first_eligible_at`.
    pub fn enroll(
        email: &str,
        attributes: Attributes,
        now: DateTime<Utc>,
        first_eligible_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecipientId::new(email),
            stage: Stage::NotStarted,
            stage_sent_at: None,
            next_eligible_at: first_eligible_at,
            retry_count: 0,
            backoff_until: None,
            stop_reason: None,
            last_message_id: None,
            attributes,
            created_at: now,
            updated_at: now,
        }
    }

    /// Due: active, past `next_eligible_at`, and outside any backoff window.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.stage.is_active()
            && self.next_eligible_at <= now
            && self.backoff_until.is_none_or(|until| until <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_id_normalizes_case_and_whitespace() {
        let id = RecipientId::new("  Alice@Example.COM ");
        assert_eq!(id.as_str(), "alice@example.com");
        assert_eq!(id, RecipientId::new("alice@example.com"));
    }

    #[test]
    fn recipient_id_validity() {
        assert!(RecipientId::new("a@b.co").is_valid());
        assert!(!RecipientId::new("nobody").is_valid());
        assert!(!RecipientId::new("@example.com").is_valid());
        assert!(!RecipientId::new("a@b@c").is_valid());
    }

    #[test]
    fn forward_transitions_are_single_step() {
        assert!(Stage::NotStarted.can_transition_to(Stage::InitialSent));
        assert!(Stage::InitialSent.can_transition_to(Stage::FollowUp1Sent));
        assert!(Stage::FollowUp1Sent.can_transition_to(Stage::FollowUp2Sent));
        assert!(!Stage::NotStarted.can_transition_to(Stage::FollowUp1Sent));
        assert!(!Stage::FollowUp1Sent.can_transition_to(Stage::InitialSent));
        assert!(!Stage::InitialSent.can_transition_to(Stage::InitialSent));
    }

    #[test]
    fn active_states_may_jump_to_terminal() {
        for from in [
            Stage::NotStarted,
            Stage::InitialSent,
            Stage::FollowUp1Sent,
            Stage::FollowUp2Sent,
        ] {
            assert!(from.can_transition_to(Stage::Replied));
            assert!(from.can_transition_to(Stage::Stopped));
            assert!(from.can_transition_to(Stage::Failed));
        }
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for from in [Stage::Replied, Stage::Stopped, Stage::Failed] {
            assert!(from.is_terminal());
            for to in Stage::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn stop_reason_lands_in_expected_stage() {
        assert_eq!(StopReason::ReplyDetected.terminal_stage(), Stage::Replied);
        assert_eq!(StopReason::AutoReplyDetected.terminal_stage(), Stage::Stopped);
        assert_eq!(StopReason::ManualStop.terminal_stage(), Stage::Stopped);
        assert_eq!(StopReason::SequenceComplete.terminal_stage(), Stage::Stopped);
        assert_eq!(StopReason::PermanentSendFailure.terminal_stage(), Stage::Failed);
        assert_eq!(StopReason::RetriesExhausted.terminal_stage(), Stage::Failed);
    }

    #[test]
    fn stage_string_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("bogus".parse::<Stage>().is_err());
        for reason in StopReason::ALL {
            assert_eq!(reason.as_str().parse::<StopReason>().unwrap(), reason);
        }
    }

    #[test]
    fn stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::FollowUp1Sent).unwrap();
        assert_eq!(json, "\"follow_up_1_sent\"");
    }


    #[test]
    fn due_respects_backoff_and_terminal() {
        let now = Utc::now();
        let mut record = RecipientRecord::enroll("a@b.co", Attributes::new(), now, now);
        assert!(record.is_due(now));

        record.backoff_until = Some(now + chrono::Duration::minutes(5));
        assert!(!record.is_due(now));
        assert!(record.is_due(now + chrono::Duration::minutes(5)));

        record.backoff_until = None;
        record.stage = Stage::Replied;
        assert!(!record.is_due(now));
    }

    #[test]
    fn attribute_values_display() {
        assert_eq!(AttributeValue::from("Acme").to_string(), "Acme");
        assert_eq!(AttributeValue::from(42.0).to_string(), "42");
        assert_eq!(AttributeValue::from(2.5).to_string(), "2.5");
    }

    #[test]
    fn attributes_deserialize_untagged() {
        let attrs: Attributes =
            serde_json::from_str(r#"{"first_name":"Ada","employees":120}"#).unwrap();
        assert_eq!(attrs["first_name"], AttributeValue::Text("Ada".into()));
        assert_eq!(attrs["employees"], AttributeValue::Number(120.0));
    }
}
