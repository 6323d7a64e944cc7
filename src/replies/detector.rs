//! Mailbox polling: turns inbound replies into terminal transitions.
//!
//! A sweep:
//! 1. Fetches messages received since the cursor
//! 2. Skips self-sent and already-processed messages
//! 3. Classifies the rest and resolves the recipient they concern, by
//!    address first and then by `In-Reply-To`/`References` against the
//!    id of the last email we sent
//! 4. Moves a known, active recipient to its terminal stage
//! 5. Records the message id so a re-poll is a no-op
//!
//! The cursor only advances after a clean sweep, and never past the time
//! the sweep started. Overlap between sweeps is absorbed by the
//! processed-message ledger.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, MailboxError};
use crate::mail::{InboundMessage, MailboxReader};
use crate::replies::{Reply, ReplyClassifier};
use crate::sequence::{RecipientId, RecipientRecord};
use crate::store::{Expected, ProcessedMessage, SequenceRepository, WriteOutcome};

/// Counters and applied transitions from one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub fetched: usize,
    /// Transitions that this sweep applied.
    pub replies: Vec<Reply>,
    pub duplicates: usize,
    pub unmatched: usize,
    /// Messages for recipients already in a terminal stage.
    pub already_terminal: usize,
    pub self_sent: usize,
    pub errors: usize,
}

#[derive(Debug)]
struct SweepState {
    cursor: DateTime<Utc>,
    last_sweep: Option<DateTime<Utc>>,
}

pub struct ReplyDetector {
    repo: Arc<dyn SequenceRepository>,
    mailbox: Arc<dyn MailboxReader>,
    classifier: ReplyClassifier,
    /// Our own sending address; mail from it is never a reply.
    sender_address: String,
    fetch_timeout: Duration,
    /// Serializes sweeps between the poll loop and scheduler ticks.
    state: Mutex<SweepState>,
}

impl ReplyDetector {
    /// `start_cursor` is the earliest `receivedAt` the first sweep asks for.
    pub fn new(
        repo: Arc<dyn SequenceRepository>,
        mailbox: Arc<dyn MailboxReader>,
        classifier: ReplyClassifier,
        sender_address: &str,
        fetch_timeout: Duration,
        start_cursor: DateTime<Utc>,
    ) -> Self {
        Self {
            repo,
            mailbox,
            classifier,
            sender_address: sender_address.trim().to_lowercase(),
            fetch_timeout,
            state: Mutex::new(SweepState {
                cursor: start_cursor,
                last_sweep: None,
            }),
        }
    }

    pub async fn cursor(&self) -> DateTime<Utc> {
        self.state.lock().await.cursor
    }

    /// Run a sweep unless one finished less than `interval` before `now`.
    /// Mailbox failures are logged and skipped; the next interval retries.
    pub async fn sweep_if_due(
        &self,
        now: DateTime<Utc>,
        interval: chrono::Duration,
    ) -> Option<SweepReport> {
        let mut state = self.state.lock().await;
        if state.last_sweep.is_some_and(|last| now - last < interval) {
            return None;
        }
        state.last_sweep = Some(now);
        match self.sweep_locked(&mut state, now).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(backend = self.mailbox.name(), "Reply sweep skipped: {e}");
                None
            }
        }
    }

    /// Run one sweep now.
    pub async fn poll_once(&self) -> Result<SweepReport, MailboxError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.last_sweep = Some(now);
        self.sweep_locked(&mut state, now).await
    }

    async fn sweep_locked(
        &self,
        state: &mut SweepState,
        started_at: DateTime<Utc>,
    ) -> Result<SweepReport, MailboxError> {
        let since = state.cursor;
        let messages =
            match tokio::time::timeout(self.fetch_timeout, self.mailbox.fetch_new_messages(since))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(MailboxError::Timeout {
                        backend: self.mailbox.name().to_string(),
                        timeout: self.fetch_timeout,
                    });
                }
            };

        let mut report = SweepReport {
            fetched: messages.len(),
            ..SweepReport::default()
        };

        for message in &messages {
            if let Err(e) = self.process_message(message, &mut report).await {
                warn!(message_id = %message.message_id, "Failed to apply reply: {e}");
                report.errors += 1;
            }
        }

        if report.errors == 0
            && let Some(newest) = messages.iter().map(|m| m.received_at).max()
        {
            state.cursor = state.cursor.max(newest.min(started_at));
        }

        if !report.replies.is_empty() {
            info!(
                fetched = report.fetched,
                applied = report.replies.len(),
                "Reply sweep halted sequences"
            );
        } else {
            debug!(fetched = report.fetched, "Reply sweep found nothing new");
        }
        Ok(report)
    }

    async fn process_message(
        &self,
        message: &InboundMessage,
        report: &mut SweepReport,
    ) -> Result<(), DatabaseError> {
        if message.from == self.sender_address {
            report.self_sent += 1;
            return Ok(());
        }

        if self.repo.is_message_processed(&message.message_id).await? {
            report.duplicates += 1;
            return Ok(());
        }

        let classification = self.classifier.classify(message);
        let Some(record) = self
            .resolve_recipient(message, classification.recipient_address.as_deref())
            .await?
        else {
            debug!(from = %message.from, "Ignoring message from unknown sender");
            report.unmatched += 1;
            return Ok(());
        };
        let id = record.id.clone();

        let class = classification.class;
        if record.stage.is_terminal() {
            report.already_terminal += 1;
        } else {
            match self
                .repo
                .mark_terminal(&id, Expected::AnyActive, class.stop_reason())
                .await?
            {
                WriteOutcome::Applied => {
                    info!(
                        recipient = %id,
                        from_stage = %record.stage,
                        class = %class,
                        "Sequence halted by inbound message"
                    );
                    report.replies.push(Reply {
                        recipient: id.clone(),
                        message_id: message.message_id.clone(),
                        class,
                        received_at: message.received_at,
                    });
                }
                WriteOutcome::Stale => {
                    debug!(recipient = %id, "Recipient became terminal concurrently");
                    report.already_terminal += 1;
                }
            }
        }

        self.repo
            .record_processed_message(&ProcessedMessage {
                message_id: message.message_id.clone(),
                recipient: id,
                class,
                received_at: message.received_at,
            })
            .await?;
        Ok(())
    }

    /// The record a message concerns: the classified address if we know it,
    /// else whichever recipient we last sent a referenced message id to.
    async fn resolve_recipient(
        &self,
        message: &InboundMessage,
        address: Option<&str>,
    ) -> Result<Option<RecipientRecord>, DatabaseError> {
        if let Some(address) = address
            && let Some(record) = self.repo.get(&RecipientId::new(address)).await?
        {
            return Ok(Some(record));
        }

        for referenced in referenced_message_ids(message) {
            if let Some(record) = self.repo.find_by_message_id(referenced).await? {
                debug!(
                    recipient = %record.id,
                    from = %message.from,
                    "Matched message by thread headers"
                );
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// Message ids named by `In-Reply-To` then `References`, most specific
/// first. Accepts both `<id>` and bare ids.
fn referenced_message_ids(message: &InboundMessage) -> Vec<&str> {
    ["In-Reply-To", "References"]
        .into_iter()
        .filter_map(|name| message.header(name))
        .flat_map(|value| value.split(|c: char| c.is_whitespace() || c == ','))
        .map(|token| token.trim_start_matches('<').trim_end_matches('>'))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Spawn the independent reply-polling loop. Exits when `shutdown` flips
/// to `true` (or its sender is dropped), after any sweep in progress.
pub fn spawn_reply_poller(
    detector: Arc<ReplyDetector>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reply poller started, polling every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = detector.poll_once().await {
                        warn!("Reply poll failed, retrying next interval: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reply poller shutting down");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replies::ReplyClass;
    use crate::sequence::{Attributes, Stage, StopReason};
    use crate::store::StageAdvance;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;

    struct FakeMailbox {
        messages: parking_lot::Mutex<Vec<InboundMessage>>,
        fail: std::sync::atomic::AtomicBool,
        seen_since: parking_lot::Mutex<Vec<DateTime<Utc>>>,
    }

    impl FakeMailbox {
        fn new(messages: Vec<InboundMessage>) -> Self {
            Self {
                messages: parking_lot::Mutex::new(messages),
                fail: std::sync::atomic::AtomicBool::new(false),
                seen_since: parking_lot::Mutex::new(Vec::new()),
            }
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
            self.seen_since.lock().push(since);
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(MailboxError::Unreachable {
                    backend: "fake".into(),
                    reason: "down".into(),
                });
            }
            Ok(self.messages.lock().clone())
        }
    }

    fn inbound(id: &str, from: &str, subject: &str, at: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            message_id: id.into(),
            from: from.into(),
            subject: subject.into(),
            headers: Vec::new(),
            received_at: at,
        }
    }

    async fn setup(messages: Vec<InboundMessage>) -> (ReplyDetector, Arc<LibSqlBackend>, Arc<FakeMailbox>) {
        let repo = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();
        for email in ["ada@example.com", "bob@example.com"] {
            repo.enroll(&RecipientRecord::enroll(email, Attributes::new(), now, now))
                .await
                .unwrap();
        }
        let mailbox = Arc::new(FakeMailbox::new(messages));
        let detector = ReplyDetector::new(
            repo.clone(),
            mailbox.clone(),
            ReplyClassifier::default_rules().unwrap(),
            "outreach@example.com",
            Duration::from_secs(5),
            now - chrono::Duration::hours(1),
        );
        (detector, repo, mailbox)
    }

    #[tokio::test]
    async fn human_reply_marks_replied() {
        let now = Utc::now();
        let (detector, repo, _) =
            setup(vec![inbound("<r1>", "ada@example.com", "Re: hello", now)]).await;

        let report = detector.poll_once().await.unwrap();
        assert_eq!(report.replies.len(), 1);
        assert_eq!(report.replies[0].class, ReplyClass::HumanReply);

        let record = repo.get(&RecipientId::new("ada@example.com")).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Replied);
        assert_eq!(record.stop_reason, Some(StopReason::ReplyDetected));
    }

    #[tokio::test]
    async fn auto_reply_marks_stopped() {
        let now = Utc::now();
        let (detector, repo, _) = setup(vec![inbound(
            "<r1>",
            "bob@example.com",
            "Out of office: hello",
            now,
        )])
        .await;

        detector.poll_once().await.unwrap();
        let record = repo.get(&RecipientId::new("bob@example.com")).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Stopped);
        assert_eq!(record.stop_reason, Some(StopReason::AutoReplyDetected));
    }

    #[tokio::test]
    async fn reprocessing_same_message_is_a_no_op() {
        let now = Utc::now();
        let (detector, repo, _) =
            setup(vec![inbound("<r1>", "ada@example.com", "Re: hello", now)]).await;

        let first = detector.poll_once().await.unwrap();
        let after_first = repo.get(&RecipientId::new("ada@example.com")).await.unwrap();
        let second = detector.poll_once().await.unwrap();
        let after_second = repo.get(&RecipientId::new("ada@example.com")).await.unwrap();

        assert_eq!(first.replies.len(), 1);
        assert!(second.replies.is_empty());
        assert_eq!(second.duplicates, 1);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn unknown_and_self_sent_are_ignored() {
        let now = Utc::now();
        let (detector, _, _) = setup(vec![
            inbound("<r1>", "stranger@example.com", "Hello", now),
            inbound("<r2>", "outreach@example.com", "Quick question", now),
        ])
        .await;

        let report = detector.poll_once().await.unwrap();
        assert!(report.replies.is_empty());
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.self_sent, 1);
    }

    #[tokio::test]
    async fn bounce_fails_named_recipient() {
        let now = Utc::now();
        let mut bounce = inbound("<b1>", "mailer-daemon@mx.example.net", "Undeliverable: hello", now);
        bounce
            .headers
            .push(("X-Failed-Recipients".into(), "bob@example.com".into()));
        let (detector, repo, _) = setup(vec![bounce]).await;

        detector.poll_once().await.unwrap();
        let record = repo.get(&RecipientId::new("bob@example.com")).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Failed);
        assert_eq!(record.stop_reason, Some(StopReason::PermanentSendFailure));
    }

    #[tokio::test]
    async fn reply_after_manual_stop_keeps_first_reason() {
        let now = Utc::now();
        let (detector, repo, _) =
            setup(vec![inbound("<r1>", "ada@example.com", "Re: hello", now)]).await;
        let id = RecipientId::new("ada@example.com");
        repo.mark_terminal(&id, Expected::AnyActive, StopReason::ManualStop)
            .await
            .unwrap();

        let report = detector.poll_once().await.unwrap();
        assert!(report.replies.is_empty());
        assert_eq!(report.already_terminal, 1);
        let record = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(record.stop_reason, Some(StopReason::ManualStop));
    }

    #[tokio::test]
    async fn cursor_advances_only_on_success() {
        let received = Utc::now() - chrono::Duration::minutes(5);
        let (detector, _, mailbox) =
            setup(vec![inbound("<r1>", "ada@example.com", "Re: hello", received)]).await;
        let start = detector.cursor().await;

        mailbox.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(detector.poll_once().await.is_err());
        assert_eq!(detector.cursor().await, start);

        mailbox.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        detector.poll_once().await.unwrap();
        assert_eq!(detector.cursor().await, received);
    }

    #[tokio::test]
    async fn future_dated_message_does_not_push_cursor_ahead() {
        let now = Utc::now();
        let forged = now + chrono::Duration::days(3650);
        let (detector, repo, mailbox) =
            setup(vec![inbound("<f1>", "stranger@example.com", "Hello", forged)]).await;

        let report = detector.sweep_if_due(now, chrono::Duration::minutes(15)).await.unwrap();
        assert_eq!(report.unmatched, 1);
        assert_eq!(detector.cursor().await, now);

        let reply_at = now + chrono::Duration::minutes(20);
        mailbox
            .messages
            .lock()
            .push(inbound("<r1>", "ada@example.com", "Re: hello", reply_at));
        let report = detector
            .sweep_if_due(reply_at, chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(report.replies.len(), 1);
        assert_eq!(mailbox.seen_since.lock().last(), Some(&now));

        let record = repo.get(&RecipientId::new("ada@example.com")).await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Replied);
    }

    #[tokio::test]
    async fn reply_from_other_address_matches_by_in_reply_to() {
        let now = Utc::now();
        let mut forwarded = inbound("<r1>", "ada.personal@example.org", "Re: hello", now);
        forwarded
            .headers
            .push(("In-Reply-To".into(), "<sent-ada@example.com>".into()));
        let mut threaded = inbound("<r2>", "assistant@example.org", "Re: hello", now);
        threaded.headers.push((
            "References".into(),
            "<unrelated@example.net> <sent-bob@example.com>".into(),
        ));
        let (detector, repo, _) = setup(vec![forwarded, threaded]).await;

        for (email, message_id) in [
            ("ada@example.com", "<sent-ada@example.com>"),
            ("bob@example.com", "sent-bob@example.com"),
        ] {
            let sent = StageAdvance {
                from: Stage::NotStarted,
                to: Stage::InitialSent,
                sent_at: now,
                next_eligible_at: now + chrono::Duration::days(14),
                message_id: Some(message_id.into()),
            };
            repo.advance_stage(&RecipientId::new(email), &sent).await.unwrap();
        }

        let report = detector.poll_once().await.unwrap();
        assert_eq!(report.replies.len(), 2);
        assert_eq!(report.unmatched, 0);
        for email in ["ada@example.com", "bob@example.com"] {
            let record = repo.get(&RecipientId::new(email)).await.unwrap().unwrap();
            assert_eq!(record.stage, Stage::Replied, "{email}");
        }
    }

    #[tokio::test]
    async fn sweep_if_due_respects_interval() {
        let (detector, _, mailbox) = setup(Vec::new()).await;
        let now = Utc::now();
        let interval = chrono::Duration::minutes(15);

        assert!(detector.sweep_if_due(now, interval).await.is_some());
        assert!(detector.sweep_if_due(now + chrono::Duration::minutes(1), interval).await.is_none());
        assert!(detector.sweep_if_due(now + interval, interval).await.is_some());
        assert_eq!(mailbox.seen_since.lock().len(), 2);
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let (detector, _, _) = setup(Vec::new()).await;
        let (tx, rx) = watch::channel(false);
        let handle = spawn_reply_poller(Arc::new(detector), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
