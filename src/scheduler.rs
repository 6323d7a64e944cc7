//! Sequence scheduler: the tick loop that drives every recipient forward.
//!
//! One tick:
//! 1. Reply sweep (if the poll interval has elapsed)
//! 2. Fetch due recipients, oldest-due first
//! 3. Per recipient: take a send from the rate limiter, or skip until next tick
//! 4. Dispatch once and record the result with a conditional write
//!
//! Recipients are independent: a failure for one never stops the tick.
//! Every write is conditional on the stage the tick read, so a reply that
//! lands mid-send turns the subsequent advance into a stale no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchOutcome, DispatchPipeline, RetryPolicy};
use crate::error::DatabaseError;
use crate::limiter::{Acquire, LimiterSnapshot, RateLimiter};
use crate::replies::ReplyDetector;
use crate::sequence::{
    Attributes, NextStep, RecipientId, RecipientRecord, SequencePlan, Stage, StopReason,
};
use crate::store::{Expected, SequenceRepository, StageAdvance, StatusCounts, WriteOutcome};

/// Loop settings for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Minimum gap between reply sweeps run from a tick.
    pub reply_check_interval: chrono::Duration,
    /// Sends allowed in flight at once within a tick.
    pub send_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            reply_check_interval: chrono::Duration::minutes(15),
            send_concurrency: 4,
        }
    }
}

/// What happened to one due recipient during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientOutcome {
    Sent { stage: Stage },
    Completed,
    /// Rate limiter denied; still due next tick.
    Deferred { retry_after: Duration },
    /// Retryable failure; backoff applied.
    RetryScheduled { failures: u32 },
    Failed { reason: StopReason },
    /// Lost a race with another writer.
    Stale,
    Error(String),
}

/// Per-tick counters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub replies_applied: usize,
    pub due: usize,
    pub sent: usize,
    pub completed: usize,
    pub deferred: usize,
    pub retries_scheduled: usize,
    pub failed: usize,
    pub stale: usize,
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &RecipientOutcome) {
        match outcome {
            RecipientOutcome::Sent { .. } => self.sent += 1,
            RecipientOutcome::Completed => self.completed += 1,
            RecipientOutcome::Deferred { .. } => self.deferred += 1,
            RecipientOutcome::RetryScheduled { .. } => self.retries_scheduled += 1,
            RecipientOutcome::Failed { .. } => self.failed += 1,
            RecipientOutcome::Stale => self.stale += 1,
            RecipientOutcome::Error(_) => self.errors += 1,
        }
    }
}

/// Result of a manual stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualStopOutcome {
    Stopped,
    AlreadyTerminal(Stage),
    NotFound,
}

/// Result of an enrolment request.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    Enrolled(RecipientRecord),
    AlreadyEnrolled,
    InvalidAddress,
}

/// Status payload for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub limiter: LimiterSnapshot,
}

pub struct Scheduler {
    repo: Arc<dyn SequenceRepository>,
    limiter: Arc<RateLimiter>,
    pipeline: DispatchPipeline,
    detector: Option<Arc<ReplyDetector>>,
    plan: SequencePlan,
    retry: RetryPolicy,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn SequenceRepository>,
        limiter: Arc<RateLimiter>,
        pipeline: DispatchPipeline,
        plan: SequencePlan,
        retry: RetryPolicy,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            limiter,
            pipeline,
            detector: None,
            plan,
            retry,
            config,
        }
    }

    /// Run a reply sweep at the start of each tick.
    pub fn with_reply_detector(mut self, detector: Arc<ReplyDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn plan(&self) -> &SequencePlan {
        &self.plan
    }

    // ── Tick ────────────────────────────────────────────────────────

    /// Run one scheduling pass as of `now`.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if let Some(detector) = &self.detector
            && let Some(sweep) = detector
                .sweep_if_due(now, self.config.reply_check_interval)
                .await
        {
            report.replies_applied = sweep.replies.len();
        }

        let due = match self.repo.due_recipients(now).await {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to load due recipients: {e}");
                report.errors += 1;
                return report;
            }
        };
        report.due = due.len();

        // `buffered` starts futures in order, so limiter grants follow
        // oldest-due-first even with several sends in flight.
        let outcomes: Vec<RecipientOutcome> = futures::stream::iter(due)
            .map(|record| self.process_recipient(record, now))
            .buffered(self.config.send_concurrency.max(1))
            .collect()
            .await;

        for outcome in &outcomes {
            report.record(outcome);
        }

        if report.due > 0 || report.replies_applied > 0 {
            info!(
                due = report.due,
                sent = report.sent,
                completed = report.completed,
                deferred = report.deferred,
                retries = report.retries_scheduled,
                failed = report.failed,
                replies = report.replies_applied,
                "Scheduler tick finished"
            );
        }
        report
    }

    async fn process_recipient(&self, record: RecipientRecord, now: DateTime<Utc>) -> RecipientOutcome {
        let id = record.id.clone();
        match self.drive(record, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(recipient = %id, "Failed to process recipient: {e}");
                RecipientOutcome::Error(e.to_string())
            }
        }
    }

    async fn drive(
        &self,
        record: RecipientRecord,
        now: DateTime<Utc>,
    ) -> Result<RecipientOutcome, DatabaseError> {
        let stage = record.stage;
        let Some(step) = self.plan.next_step(stage) else {
            return Ok(RecipientOutcome::Stale);
        };

        let (index, advance_to) = match step {
            NextStep::Complete => return self.complete(&record.id, stage).await,
            NextStep::Send { index, advance_to } => (index, advance_to),
        };

        if let Acquire::Denied { retry_after } = self.limiter.try_acquire() {
            debug!(recipient = %record.id, ?retry_after, "Send deferred by rate limiter");
            return Ok(RecipientOutcome::Deferred { retry_after });
        }

        let outcome = self.pipeline.dispatch(&record, index).await;
        if let Some(feedback) = outcome.feedback() {
            self.limiter.report(feedback);
        }

        match outcome {
            DispatchOutcome::Sent { message_id } => {
                let advance = StageAdvance {
                    from: stage,
                    to: advance_to,
                    sent_at: now,
                    next_eligible_at: self.plan.next_eligible_at(advance_to, now),
                    message_id,
                };
                match self.repo.advance_stage(&record.id, &advance).await? {
                    WriteOutcome::Applied => {
                        info!(
                            recipient = %record.id,
                            stage = %advance_to,
                            next_eligible_at = %advance.next_eligible_at,
                            "Email sent"
                        );
                        Ok(RecipientOutcome::Sent { stage: advance_to })
                    }
                    WriteOutcome::Stale => {
                        debug!(recipient = %record.id, "Sent, but recipient moved on during send");
                        Ok(RecipientOutcome::Stale)
                    }
                }
            }
            DispatchOutcome::Permanent(reason) => {
                warn!(recipient = %record.id, stage = %stage, "Permanent send failure: {reason}");
                self.fail(&record.id, stage, StopReason::PermanentSendFailure)
                    .await
            }
            DispatchOutcome::Transient(reason) => {
                warn!(recipient = %record.id, stage = %stage, "Transient send failure: {reason}");
                self.schedule_retry(&record, now, None).await
            }
            DispatchOutcome::Throttled { retry_after } => {
                warn!(recipient = %record.id, stage = %stage, ?retry_after, "Send throttled by provider");
                self.schedule_retry(&record, now, retry_after).await
            }
        }
    }

    async fn complete(
        &self,
        id: &RecipientId,
        stage: Stage,
    ) -> Result<RecipientOutcome, DatabaseError> {
        match self
            .repo
            .mark_terminal(id, Expected::Stage(stage), StopReason::SequenceComplete)
            .await?
        {
            WriteOutcome::Applied => {
                info!(recipient = %id, after = %stage, "Sequence complete with no reply");
                Ok(RecipientOutcome::Completed)
            }
            WriteOutcome::Stale => Ok(RecipientOutcome::Stale),
        }
    }

    async fn fail(
        &self,
        id: &RecipientId,
        stage: Stage,
        reason: StopReason,
    ) -> Result<RecipientOutcome, DatabaseError> {
        match self.repo.mark_terminal(id, Expected::Stage(stage), reason).await? {
            WriteOutcome::Applied => Ok(RecipientOutcome::Failed { reason }),
            WriteOutcome::Stale => {
                debug!(recipient = %id, "Failure not recorded, recipient already moved on");
                Ok(RecipientOutcome::Stale)
            }
        }
    }

    async fn schedule_retry(
        &self,
        record: &RecipientRecord,
        now: DateTime<Utc>,
        provider_hint: Option<Duration>,
    ) -> Result<RecipientOutcome, DatabaseError> {
        let failures = record.retry_count.saturating_add(1);
        let backoff_until = self.retry.backoff_until(now, failures, provider_hint);

        let Some(failures) = self
            .repo
            .increment_retry(&record.id, record.stage, backoff_until)
            .await?
        else {
            return Ok(RecipientOutcome::Stale);
        };

        if self.retry.is_exhausted(failures) {
            warn!(recipient = %record.id, failures, "Retry ceiling reached");
            return self
                .fail(&record.id, record.stage, StopReason::RetriesExhausted)
                .await;
        }

        debug!(recipient = %record.id, failures, %backoff_until, "Retry scheduled");
        Ok(RecipientOutcome::RetryScheduled { failures })
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Enrol a recipient. Their initial email becomes due after the
    /// configured initial delay.
    pub async fn enroll(
        &self,
        email: &str,
        attributes: Attributes,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome, DatabaseError> {
        let first_eligible_at = self.plan.next_eligible_at(Stage::NotStarted, now);
        let record = RecipientRecord::enroll(email, attributes, now, first_eligible_at);
        if !record.id.is_valid() {
            return Ok(EnrollOutcome::InvalidAddress);
        }
        if self.repo.enroll(&record).await? {
            info!(recipient = %record.id, %first_eligible_at, "Recipient enrolled");
            Ok(EnrollOutcome::Enrolled(record))
        } else {
            Ok(EnrollOutcome::AlreadyEnrolled)
        }
    }

    /// Stop a recipient's sequence. Always permitted, always idempotent.
    pub async fn stop_recipient(&self, email: &str) -> Result<ManualStopOutcome, DatabaseError> {
        let id = RecipientId::new(email);
        let Some(record) = self.repo.get(&id).await? else {
            return Ok(ManualStopOutcome::NotFound);
        };
        if record.stage.is_terminal() {
            return Ok(ManualStopOutcome::AlreadyTerminal(record.stage));
        }

        match self
            .repo
            .mark_terminal(&id, Expected::AnyActive, StopReason::ManualStop)
            .await?
        {
            WriteOutcome::Applied => {
                info!(recipient = %id, from_stage = %record.stage, "Sequence stopped manually");
                Ok(ManualStopOutcome::Stopped)
            }
            WriteOutcome::Stale => {
                let stage = self
                    .repo
                    .get(&id)
                    .await?
                    .map_or(Stage::Stopped, |current| current.stage);
                Ok(ManualStopOutcome::AlreadyTerminal(stage))
            }
        }
    }

    pub async fn get(&self, email: &str) -> Result<Option<RecipientRecord>, DatabaseError> {
        self.repo.get(&RecipientId::new(email)).await
    }

    /// Every record, in enrolment order.
    pub async fn recipients(&self) -> Result<Vec<RecipientRecord>, DatabaseError> {
        self.repo.list_recipients().await
    }

    /// Counts per stage and stop reason, plus the limiter's current view.
    pub async fn status(&self) -> Result<StatusReport, DatabaseError> {
        Ok(StatusReport {
            counts: self.repo.status_counts().await?,
            limiter: self.limiter.snapshot(),
        })
    }
}

/// Spawn the tick loop. On shutdown the tick in progress finishes (its
/// sends complete or time out) and no new tick starts.
pub fn spawn_scheduler(
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = scheduler.config.tick_interval;
        info!("Scheduler started, ticking every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    scheduler.run_tick(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler shutting down");
    })
}
