//! Single-attempt send: render, send with a timeout, classify.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::dispatch::DispatchOutcome;
use crate::error::RenderError;
use crate::mail::{MailSender, TemplateRenderer};
use crate::sequence::RecipientRecord;

/// Wraps one send attempt. Never retries; the scheduler decides what a
/// failure means for the recipient.
pub struct DispatchPipeline {
    sender: Arc<dyn MailSender>,
    renderer: Arc<dyn TemplateRenderer>,
    send_timeout: Duration,
}

impl DispatchPipeline {
    pub fn new(
        sender: Arc<dyn MailSender>,
        renderer: Arc<dyn TemplateRenderer>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            sender,
            renderer,
            send_timeout,
        }
    }

    /// Render email `stage_index` for `record` and send it once.
    pub async fn dispatch(&self, record: &RecipientRecord, stage_index: u8) -> DispatchOutcome {
        if !record.id.is_valid() {
            return DispatchOutcome::Permanent(format!("invalid recipient address: {}", record.id));
        }

        let email = match self.renderer.render(stage_index, &record.attributes) {
            Ok(email) => email,
            // A missing attribute is specific to this recipient; a missing or
            // unreadable template can be fixed by the operator.
            Err(e @ RenderError::MissingAttribute { .. }) => {
                return DispatchOutcome::Permanent(e.to_string());
            }
            Err(e) => return DispatchOutcome::Transient(e.to_string()),
        };

        let send = self
            .sender
            .send(record.id.as_str(), &email.subject, &email.body);
        let outcome = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(outcome) => outcome,
            Err(_) => DispatchOutcome::Transient(format!(
                "{} send timed out after {:?}",
                self.sender.name(),
                self.send_timeout
            )),
        };

        debug!(
            recipient = %record.id,
            stage_index,
            backend = self.sender.name(),
            outcome = outcome.kind(),
            "Send attempt finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::RenderedEmail;
    use crate::sequence::Attributes;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct RecordingSender {
        delay: Duration,
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl MailSender for RecordingSender {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, to: &str, subject: &str, body: &str) -> DispatchOutcome {
            tokio::time::sleep(self.delay).await;
            self.sent
                .lock()
                .push((to.to_string(), subject.to_string(), body.to_string()));
            DispatchOutcome::Sent {
                message_id: Some("provider-1".into()),
            }
        }
    }

    struct StubRenderer {
        fail_with: Option<fn() -> RenderError>,
    }

    impl TemplateRenderer for StubRenderer {
        fn render(&self, stage_index: u8, _: &Attributes) -> Result<RenderedEmail, RenderError> {
            if let Some(make) = self.fail_with {
                return Err(make());
            }
            Ok(RenderedEmail {
                subject: format!("Stage {stage_index}"),
                body: "Hello".into(),
            })
        }
    }

    fn pipeline(delay: Duration, fail_with: Option<fn() -> RenderError>) -> (DispatchPipeline, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender {
            delay,
            sent: Mutex::new(Vec::new()),
        });
        let renderer = Arc::new(StubRenderer { fail_with });
        (
            DispatchPipeline::new(sender.clone(), renderer, Duration::from_millis(200)),
            sender,
        )
    }

    fn record(email: &str) -> RecipientRecord {
        let now = Utc::now();
        RecipientRecord::enroll(email, Attributes::new(), now, now)
    }

    #[tokio::test]
    async fn renders_and_sends() {
        let (pipeline, sender) = pipeline(Duration::ZERO, None);
        let outcome = pipeline.dispatch(&record("ada@example.com"), 1).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Sent {
                message_id: Some("provider-1".into())
            }
        );
        let sent = sender.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ada@example.com");
        assert_eq!(sent[0].1, "Stage 1");
    }

    #[tokio::test]
    async fn invalid_address_is_permanent() {
        let (pipeline, sender) = pipeline(Duration::ZERO, None);
        let outcome = pipeline.dispatch(&record("not-an-address"), 0).await;
        assert!(matches!(outcome, DispatchOutcome::Permanent(_)));
        assert!(sender.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn slow_send_times_out_as_transient() {
        let (pipeline, _) = pipeline(Duration::from_secs(5), None);
        let outcome = pipeline.dispatch(&record("ada@example.com"), 0).await;
        assert!(matches!(outcome, DispatchOutcome::Transient(reason) if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn missing_attribute_is_permanent() {
        let (pipeline, _) = pipeline(
            Duration::ZERO,
            Some(|| RenderError::MissingAttribute {
                stage: 0,
                key: "first_name".into(),
            }),
        );
        let outcome = pipeline.dispatch(&record("ada@example.com"), 0).await;
        assert!(matches!(outcome, DispatchOutcome::Permanent(_)));
    }

    #[tokio::test]
    async fn missing_template_is_transient() {
        let (pipeline, _) = pipeline(
            Duration::ZERO,
            Some(|| RenderError::MissingTemplate { stage: 2 }),
        );
        let outcome = pipeline.dispatch(&record("ada@example.com"), 2).await;
        assert!(matches!(outcome, DispatchOutcome::Transient(_)));
    }
}
