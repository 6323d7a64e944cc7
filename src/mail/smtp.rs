//! SMTP sender via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::dispatch::DispatchOutcome;
use crate::error::ConfigError;
use crate::mail::MailSender;

/// SMTP connection settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub timeout: Duration,
}

/// Outbound mail over an authenticated SMTP relay.
pub struct SmtpMailSender {
    transport: SmtpTransport,
    from: Mailbox,
    domain: String,
}

impl SmtpMailSender {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| ConfigError::invalid("SENDER_EMAIL", format!("{e}")))?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| ConfigError::invalid("SMTP_HOST", format!("SMTP relay error: {e}")))?
            .port(config.port)
            .credentials(creds)
            .timeout(Some(config.timeout))
            .build();

        let domain = from.email.domain().to_string();
        Ok(Self {
            transport,
            from,
            domain,
        })
    }
}

#[async_trait]
impl MailSender for SmtpMailSender {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> DispatchOutcome {
        let to: Mailbox = match to.parse() {
            Ok(to) => to,
            Err(e) => return DispatchOutcome::Permanent(format!("Invalid to address: {e}")),
        };

        let message_id = format!("<{}@{}>", Uuid::new_v4(), self.domain);
        let email = match Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .body(body.to_string())
        {
            Ok(email) => email,
            Err(e) => return DispatchOutcome::Permanent(format!("Failed to build email: {e}")),
        };

        // lettre's SmtpTransport is blocking.
        let transport = self.transport.clone();
        match tokio::task::spawn_blocking(move || transport.send(&email)).await {
            Ok(Ok(_)) => DispatchOutcome::Sent {
                message_id: Some(message_id),
            },
            Ok(Err(e)) => classify_smtp_error(
                e.status().map(|code| code.to_string()).as_deref(),
                e.is_permanent(),
                &e.to_string(),
            ),
            Err(e) => DispatchOutcome::Transient(format!("SMTP task failed: {e}")),
        }
    }
}

/// Map an SMTP reply code onto the dispatch taxonomy.
///
/// Authentication failures are 5xx but say nothing about the recipient,
/// so they stay retryable.
pub(crate) fn classify_smtp_error(
    code: Option<&str>,
    is_permanent: bool,
    reason: &str,
) -> DispatchOutcome {
    match code {
        Some("421" | "450" | "452") => DispatchOutcome::Throttled { retry_after: None },
        Some("530" | "534" | "535") => DispatchOutcome::Transient(format!("SMTP auth: {reason}")),
        _ if is_permanent => DispatchOutcome::Permanent(format!("SMTP rejected: {reason}")),
        _ => DispatchOutcome::Transient(format!("SMTP send failed: {reason}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_codes_are_throttles() {
        for code in ["421", "450", "452"] {
            assert_eq!(
                classify_smtp_error(Some(code), false, "busy"),
                DispatchOutcome::Throttled { retry_after: None }
            );
        }
    }

    #[test]
    fn mailbox_unavailable_is_permanent() {
        assert!(matches!(
            classify_smtp_error(Some("550"), true, "no such user"),
            DispatchOutcome::Permanent(_)
        ));
    }

    #[test]
    fn auth_failure_stays_retryable() {
        assert!(matches!(
            classify_smtp_error(Some("535"), true, "bad credentials"),
            DispatchOutcome::Transient(_)
        ));
    }

    #[test]
    fn connection_errors_are_transient() {
        assert!(matches!(
            classify_smtp_error(None, false, "connection refused"),
            DispatchOutcome::Transient(_)
        ));
    }

    #[test]
    fn rejects_invalid_from_address() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "outreach".into(),
            password: SecretString::from("secret".to_string()),
            from_address: "not an address".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(SmtpMailSender::new(&config).is_err());
    }

    #[tokio::test]
    async fn invalid_recipient_is_permanent_without_connecting() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "outreach".into(),
            password: SecretString::from("secret".to_string()),
            from_address: "outreach@example.com".into(),
            timeout: Duration::from_secs(5),
        };
        let sender = SmtpMailSender::new(&config).unwrap();
        let outcome = sender.send("no-at-sign", "Hi", "Body").await;
        assert!(matches!(outcome, DispatchOutcome::Permanent(_)));
    }
}
