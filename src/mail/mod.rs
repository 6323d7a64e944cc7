//! Mail collaborators (outbound sender, inbound mailbox reader, per-stage
//! template renderer) plus the backends that implement them.

pub mod graph;
pub mod imap;
pub mod smtp;
pub mod template;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dispatch::DispatchOutcome;
use crate::error::{MailboxError, RenderError};
use crate::sequence::Attributes;

pub use graph::{GraphConfig, GraphMailClient};
pub use imap::{ImapConfig, ImapMailboxReader};
pub use smtp::{SmtpConfig, SmtpMailSender};
pub use template::FileTemplateRenderer;

/// A rendered email ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// An inbound message as seen by the reply detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    /// Bare sender address.
    pub from: String,
    pub subject: String,
    /// Header name/value pairs in arrival order. Names keep their case.
    pub headers: Vec<(String, String)>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// First header value with `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Sends one email. Never retries internally; the outcome says what kind
/// of failure happened.
#[async_trait]
pub trait MailSender: Send + Sync {
    /// Backend name for logs ("graph", "smtp", ...).
    fn name(&self) -> &str;

    async fn send(&self, to: &str, subject: &str, body: &str) -> DispatchOutcome;
}

/// Reads messages that arrived in the outreach mailbox.
#[async_trait]
pub trait MailboxReader: Send + Sync {
    fn name(&self) -> &str;

    /// Messages received at or after `since`, in any order.
    async fn fetch_new_messages(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, MailboxError>;
}

/// Pure mapping from stage index and attributes to subject and body.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, stage_index: u8, attributes: &Attributes)
    -> Result<RenderedEmail, RenderError>;
}

/// Extract the bare address from a `From`-style value such as
/// `"Ada Lovelace" <Ada@Example.com>`, lowercased.
pub fn bare_address(value: &str) -> String {
    let value = value.trim();
    let inner = match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value,
    };
    inner.trim().trim_matches('"').to_lowercase()
}
