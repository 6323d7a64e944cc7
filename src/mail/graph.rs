//! Graph-style REST mail API. Sends through `sendMail`, reads the inbox
//! folder for replies.
//!
//! Token acquisition happens elsewhere; this client is handed a bearer token.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use uuid::Uuid;

use crate::dispatch::DispatchOutcome;
use crate::error::{ConfigError, MailboxError};
use crate::mail::{InboundMessage, MailSender, MailboxReader, bare_address};

const BACKEND: &str = "graph";
const PAGE_SIZE: u32 = 100;
/// Upper bound on pages followed per fetch.
const MAX_PAGES: usize = 10;

/// Connection settings for the Graph-style API.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub api_base: String,
    pub access_token: SecretString,
    pub sender_email: String,
    pub timeout: Duration,
}

/// One client serves as both `MailSender` and `MailboxReader`.
pub struct GraphMailClient {
    config: GraphConfig,
    client: reqwest::Client,
}

impl GraphMailClient {
    pub fn new(config: GraphConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::invalid("GRAPH_API_BASE", e.to_string()))?;
        Ok(Self { config, client })
    }

    fn user_url(&self, path: &str) -> String {
        format!(
            "{}/users/{}/{path}",
            self.config.api_base.trim_end_matches('/'),
            self.config.sender_email
        )
    }

    /// Our own `Message-ID` for an outgoing email, so replies can be matched
    /// on `In-Reply-To`.
    fn new_message_id(&self) -> String {
        let domain = self
            .config
            .sender_email
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain);
        format!("<{}@{domain}>", Uuid::new_v4())
    }

    fn send_payload(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        message_id: &str,
    ) -> serde_json::Value {
        serde_json::json!({
            "message": {
                "internetMessageId": message_id,
                "subject": subject,
                "body": { "contentType": "Text", "content": body },
                "toRecipients": [ { "emailAddress": { "address": to } } ],
                "from": { "emailAddress": { "address": self.config.sender_email } },
            },
            "saveToSentItems": true
        })
    }

    async fn fetch_page(&self, url: &str, query: &[(&str, String)]) -> Result<MessagePage, MailboxError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.config.access_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| mailbox_transport_error(e, self.config.timeout))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(MailboxError::AuthFailed {
                backend: BACKEND.into(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailboxError::Unreachable {
                backend: BACKEND.into(),
                reason: format!("inbox read returned {status}: {body}"),
            });
        }

        resp.json::<MessagePage>()
            .await
            .map_err(|e| MailboxError::InvalidResponse {
                backend: BACKEND.into(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl MailSender for GraphMailClient {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> DispatchOutcome {
        let message_id = self.new_message_id();
        let resp = match self
            .client
            .post(self.user_url("sendMail"))
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&self.send_payload(to, subject, body, &message_id))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return DispatchOutcome::Transient(format!("sendMail request failed: {e}")),
        };

        let status = resp.status();
        if status.is_success() {
            let request_id = resp.headers().get("request-id").and_then(|v| v.to_str().ok());
            tracing::debug!(recipient = to, %message_id, ?request_id, "sendMail accepted");
            return DispatchOutcome::Sent {
                message_id: Some(message_id),
            };
        }

        let retry_after = retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = %status, recipient = to, "sendMail rejected: {body}");
        classify_status(status, retry_after, &body)
    }
}

#[async_trait]
impl MailboxReader for GraphMailClient {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn fetch_new_messages(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, MailboxError> {
        let query = vec![
            (
                "$filter",
                format!(
                    "receivedDateTime ge {}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ),
            ),
            (
                "$select",
                "id,internetMessageId,subject,from,receivedDateTime,internetMessageHeaders".into(),
            ),
            ("$orderby", "receivedDateTime asc".into()),
            ("$top", PAGE_SIZE.to_string()),
        ];

        let mut messages = Vec::new();
        let mut page = self
            .fetch_page(&self.user_url("mailFolders/inbox/messages"), &query)
            .await?;
        for _ in 1..MAX_PAGES {
            let next = page.next_link.take();
            messages.extend(page.value.drain(..).filter_map(GraphMessage::into_inbound));
            match next {
                Some(link) => page = self.fetch_page(&link, &[]).await?,
                None => break,
            }
        }
        messages.extend(page.value.drain(..).filter_map(GraphMessage::into_inbound));

        tracing::debug!(count = messages.len(), since = %since, "Fetched inbox messages");
        Ok(messages)
    }
}

/// Map a non-success `sendMail` status onto the dispatch taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> DispatchOutcome {
    let reason = format!("{status}: {body}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => DispatchOutcome::Throttled { retry_after },
        StatusCode::SERVICE_UNAVAILABLE if retry_after.is_some() => {
            DispatchOutcome::Throttled { retry_after }
        }
        // Expired tokens are refreshed out of band; the send can be retried.
        StatusCode::REQUEST_TIMEOUT | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DispatchOutcome::Transient(reason)
        }
        s if s.is_server_error() => DispatchOutcome::Transient(reason),
        s if s.is_client_error() => DispatchOutcome::Permanent(reason),
        _ => DispatchOutcome::Transient(reason),
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn mailbox_transport_error(e: reqwest::Error, timeout: Duration) -> MailboxError {
    if e.is_timeout() {
        MailboxError::Timeout {
            backend: BACKEND.into(),
            timeout,
        }
    } else {
        MailboxError::Unreachable {
            backend: BACKEND.into(),
            reason: e.to_string(),
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    internet_message_id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    received_date_time: DateTime<Utc>,
    #[serde(default)]
    internet_message_headers: Vec<GraphHeader>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphHeader {
    name: String,
    value: String,
}

impl GraphMessage {
    /// Messages without a sender address carry nothing to match on.
    fn into_inbound(self) -> Option<InboundMessage> {
        let from = self.from?.email_address.address?;
        Some(InboundMessage {
            message_id: self.internet_message_id.unwrap_or(self.id),
            from: bare_address(&from),
            subject: self.subject.unwrap_or_default(),
            headers: self
                .internet_message_headers
                .into_iter()
                .map(|h| (h.name, h.value))
                .collect(),
            received_at: self.received_date_time,
        })
    }
}
