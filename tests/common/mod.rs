//! Stub collaborators and a wired-up sequencer for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use outreach_sequencer::dispatch::{DispatchOutcome, DispatchPipeline, RetryPolicy};
use outreach_sequencer::error::{MailboxError, RenderError};
use outreach_sequencer::limiter::{LimiterConfig, RateLimiter};
use outreach_sequencer::mail::{
    InboundMessage, MailSender, MailboxReader, RenderedEmail, TemplateRenderer,
};
use outreach_sequencer::replies::{ReplyClassifier, ReplyDetector};
use outreach_sequencer::scheduler::{Scheduler, SchedulerConfig};
use outreach_sequencer::sequence::{Attributes, RecipientId, RecipientRecord, SequencePlan};
use outreach_sequencer::store::{LibSqlBackend, SequenceRepository};

pub const SENDER: &str = "sales@example.com";

/// Records every send; replays scripted outcomes per recipient, else succeeds.
#[derive(Default)]
pub struct StubSender {
    scripts: Mutex<HashMap<String, VecDeque<DispatchOutcome>>>,
    sends: Mutex<Vec<(String, String)>>,
}

impl StubSender {
    pub fn script(&self, to: &str, outcomes: Vec<DispatchOutcome>) {
        self.scripts
            .lock()
            .entry(to.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// `(recipient, subject)` per attempt, in order.
    pub fn sends(&self) -> Vec<(String, String)> {
        self.sends.lock().clone()
    }

    pub fn count_for(&self, to: &str) -> usize {
        self.sends.lock().iter().filter(|(r, _)| r == to).count()
    }
}

#[async_trait]
impl MailSender for StubSender {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send(&self, to: &str, subject: &str, _body: &str) -> DispatchOutcome {
        let attempt = {
            let mut sends = self.sends.lock();
            sends.push((to.to_string(), subject.to_string()));
            sends.len()
        };
        self.scripts
            .lock()
            .get_mut(to)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| DispatchOutcome::Sent {
                message_id: Some(format!("msg-{attempt}")),
            })
    }
}

/// In-memory inbox.
#[derive(Default)]
pub struct FakeMailbox {
    messages: Mutex<Vec<InboundMessage>>,
    next_id: Mutex<u64>,
}

impl FakeMailbox {
    /// Deliver a message and return its id.
    pub fn deliver(
        &self,
        from: &str,
        subject: &str,
        headers: &[(&str, &str)],
        received_at: DateTime<Utc>,
    ) -> String {
        let message_id = {
            let mut next = self.next_id.lock();
            *next += 1;
            format!("<inbound-{}@example.net>", *next)
        };
        self.messages.lock().push(InboundMessage {
            message_id: message_id.clone(),
            from: from.to_string(),
            subject: subject.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            received_at,
        });
        message_id
    }
}

#[async_trait]
impl MailboxReader for FakeMailbox {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch_new_messages(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, MailboxError> {
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| m.received_at >= since)
            .cloned()
            .collect())
    }
}

pub struct StageSubjectRenderer;

impl TemplateRenderer for StageSubjectRenderer {
    fn render(&self, stage_index: u8, _: &Attributes) -> Result<RenderedEmail, RenderError> {
        Ok(RenderedEmail {
            subject: format!("stage {stage_index}"),
            body: "Hello".to_string(),
        })
    }
}

/// Retry policy without jitter so backoff times are exact.
pub fn exact_retry(ceiling: u32) -> RetryPolicy {
    RetryPolicy {
        ceiling,
        base_delay_secs: 300,
        max_delay_secs: 86_400,
        jitter_factor: 0.0,
    }
}

pub struct Harness {
    pub repo: Arc<LibSqlBackend>,
    pub sender: Arc<StubSender>,
    pub mailbox: Arc<FakeMailbox>,
    pub detector: Arc<ReplyDetector>,
    pub scheduler: Scheduler,
    pub start: DateTime<Utc>,
}

impl Harness {
    pub async fn new(plan: SequencePlan, retry: RetryPolicy) -> Self {
        Self::with_sender(plan, retry, Arc::new(StubSender::default())).await
    }

    pub async fn with_sender(
        plan: SequencePlan,
        retry: RetryPolicy,
        sender: Arc<StubSender>,
    ) -> Self {
        let start = Utc::now();
        let repo = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = Arc::new(FakeMailbox::default());
        let detector = Arc::new(ReplyDetector::new(
            repo.clone(),
            mailbox.clone(),
            ReplyClassifier::default_rules().unwrap(),
            SENDER,
            Duration::from_secs(5),
            start - chrono::Duration::hours(1),
        ));
        let pipeline = DispatchPipeline::new(
            sender.clone(),
            Arc::new(StageSubjectRenderer),
            Duration::from_secs(5),
        );
        let limiter = Arc::new(RateLimiter::new(LimiterConfig {
            per_minute: 1_000,
            ..LimiterConfig::default()
        }));
        let scheduler = Scheduler::new(
            repo.clone(),
            limiter,
            pipeline,
            plan,
            retry,
            SchedulerConfig::default(),
        )
        .with_reply_detector(detector.clone());

        Self {
            repo,
            sender,
            mailbox,
            detector,
            scheduler,
            start,
        }
    }

    pub async fn enroll(&self, email: &str) {
        self.scheduler
            .enroll(email, Attributes::new(), self.start)
            .await
            .unwrap();
    }

    pub async fn record(&self, email: &str) -> RecipientRecord {
        self.repo
            .get(&RecipientId::new(email))
            .await
            .unwrap()
            .unwrap()
    }

    /// Simulated time `offset` after the harness start.
    pub fn at(&self, offset: chrono::Duration) -> DateTime<Utc> {
        self.start + offset
    }
}
