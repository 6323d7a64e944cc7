//! `SequenceRepository` trait, the single async interface for sequence state.
//!
//! Every mutator is conditional on the record still being in the expected
//! prior stage. A failed precondition is reported as `WriteOutcome::Stale`,
//! never as an error: it means a concurrent actor got there first.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::replies::ReplyClass;
use crate::sequence::{RecipientId, RecipientRecord, Stage, StopReason};

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The record was not in the expected state (or does not exist).
    Stale,
}

/// Which prior stages a terminal transition accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Exactly this stage.
    Stage(Stage),
    /// Any non-terminal stage.
    AnyActive,
}

impl Expected {
    pub fn matches(&self, stage: Stage) -> bool {
        match self {
            Self::Stage(expected) => *expected == stage,
            Self::AnyActive => stage.is_active(),
        }
    }
}

/// A successful send, recorded against the stage it was sent from.
#[derive(Debug, Clone)]
pub struct StageAdvance {
    pub from: Stage,
    pub to: Stage,
    pub sent_at: DateTime<Utc>,
    /// `sent_at + delay(to)`, computed by the caller from the sequence plan.
    pub next_eligible_at: DateTime<Utc>,
    pub message_id: Option<String>,
}

/// An inbound message that has been applied (or deliberately skipped).
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub recipient: RecipientId,
    pub class: ReplyClass,
    pub received_at: DateTime<Utc>,
}

/// Recipient counts per stage and per stop reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub stages: BTreeMap<Stage, u64>,
    pub stop_reasons: BTreeMap<StopReason, u64>,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.stages.values().sum()
    }

    pub fn stage(&self, stage: Stage) -> u64 {
        self.stages.get(&stage).copied().unwrap_or(0)
    }

    pub fn reason(&self, reason: StopReason) -> u64 {
        self.stop_reasons.get(&reason).copied().unwrap_or(0)
    }
}

/// Durable store of recipient sequence records.
#[async_trait]
pub trait SequenceRepository: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Records ─────────────────────────────────────────────────────

    /// Insert a new record. Returns `false` if the recipient already exists.
    async fn enroll(&self, record: &RecipientRecord) -> Result<bool, DatabaseError>;

    /// Get a record by recipient id.
    async fn get(&self, id: &RecipientId) -> Result<Option<RecipientRecord>, DatabaseError>;

    /// Active records with `next_eligible_at <= now` outside any backoff
    /// window, oldest-due first.
    async fn due_recipients(&self, now: DateTime<Utc>)
    -> Result<Vec<RecipientRecord>, DatabaseError>;

    /// The record whose last sent email carried `message_id`. Angle
    /// brackets are optional.
    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<RecipientRecord>, DatabaseError>;

    /// Every record, in enrolment order.
    async fn list_recipients(&self) -> Result<Vec<RecipientRecord>, DatabaseError>;

    // ── Conditional transitions ─────────────────────────────────────

    /// Record a successful send: move `from -> to`, set `stage_sent_at`,
    /// `next_eligible_at`, reset `retry_count` and clear any backoff.
    async fn advance_stage(
        &self,
        id: &RecipientId,
        advance: &StageAdvance,
    ) -> Result<WriteOutcome, DatabaseError>;

    /// Move to `reason.terminal_stage()` and record `reason`.
    async fn mark_terminal(
        &self,
        id: &RecipientId,
        expected: Expected,
        reason: StopReason,
    ) -> Result<WriteOutcome, DatabaseError>;

    /// Count a transient failure and gate the record until `backoff_until`.
    /// Returns the new count, or `None` when the precondition failed.
    async fn increment_retry(
        &self,
        id: &RecipientId,
        expected: Stage,
        backoff_until: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError>;

    // ── Inbound message ledger ──────────────────────────────────────

    /// Whether an inbound message id has already been processed.
    async fn is_message_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Remember a processed inbound message. Returns `false` if it was
    /// already recorded.
    async fn record_processed_message(
        &self,
        message: &ProcessedMessage,
    ) -> Result<bool, DatabaseError>;

    // ── Reporting ───────────────────────────────────────────────────

    /// Recipient counts per stage and stop reason.
    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError>;
}
