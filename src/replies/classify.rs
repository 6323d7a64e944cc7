//! Header and subject heuristics for inbound mail.
//!
//! Checked in order:
//! - delivery-status reports → Undeliverable. A report is a message from a
//!   mailer daemon, one with `X-Failed-Recipients` or a `multipart/report`
//!   body, or a machine-generated message with a bounce subject. A bounce
//!   subject alone is not enough: people write "returned mail" too.
//! - auto-reply headers (`Auto-Submitted`, `X-Autoreply`, `Precedence`, ...) → AutoReply
//! - out-of-office style subjects → AutoReply
//! - everything else → HumanReply

use regex::Regex;
use tracing::debug;

use crate::mail::{InboundMessage, bare_address};
use crate::replies::ReplyClass;

const AUTO_REPLY_SUBJECTS: &[&str] = &[
    r"out of (the )?office",
    r"automatic reply",
    r"auto[\- ]?reply",
    r"autoreply",
    r"auto[\- ]?response",
    r"automated response",
    r"\bvacation\b",
    r"away message",
    r"currently unavailable",
    r"will be back",
    r"(maternity|paternity|sick) leave",
];

const BOUNCE_SUBJECTS: &[&str] = &[
    r"undeliverable",
    r"undelivered mail",
    r"delivery status notification",
    r"mail delivery (failed|failure|subsystem)",
    r"delivery failure",
    r"returned mail",
];

const BOUNCE_SENDER: &str = r"(?i)^(mailer[\-_]?daemon|postmaster)@";

/// Result of classifying one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: ReplyClass,
    /// The recipient this message is about: the sender, or for a bounce the
    /// failed address. `None` when a bounce does not say.
    pub recipient_address: Option<String>,
}

/// Compiled classification rules.
#[derive(Debug, Clone)]
pub struct ReplyClassifier {
    auto_reply_subjects: Vec<Regex>,
    bounce_subjects: Vec<Regex>,
    bounce_sender: Regex,
}

fn case_insensitive(patterns: &[&str]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")))
        .collect()
}

impl ReplyClassifier {
    /// Classifier with the built-in marker lists.
    pub fn default_rules() -> Result<Self, regex::Error> {
        Ok(Self {
            auto_reply_subjects: case_insensitive(AUTO_REPLY_SUBJECTS)?,
            bounce_subjects: case_insensitive(BOUNCE_SUBJECTS)?,
            bounce_sender: Regex::new(BOUNCE_SENDER)?,
        })
    }

    /// Add extra auto-reply subject patterns (case-insensitive regexes).
    pub fn with_auto_reply_patterns(mut self, patterns: &[String]) -> Result<Self, regex::Error> {
        for pattern in patterns {
            self.auto_reply_subjects
                .push(Regex::new(&format!("(?i){pattern}"))?);
        }
        Ok(self)
    }

    pub fn classify(&self, message: &InboundMessage) -> Classification {
        if self.is_bounce(message) {
            let recipient_address = message
                .header("X-Failed-Recipients")
                .and_then(|value| value.split(',').next())
                .map(bare_address)
                .filter(|addr| !addr.is_empty())
                .or_else(|| {
                    (!self.bounce_sender.is_match(&message.from)).then(|| message.from.clone())
                });
            return Classification {
                class: ReplyClass::Undeliverable,
                recipient_address,
            };
        }

        let class = if let Some(header) = auto_reply_header(message) {
            debug!(from = %message.from, header, "Auto-reply header present");
            ReplyClass::AutoReply
        } else if self
            .auto_reply_subjects
            .iter()
            .any(|r| r.is_match(&message.subject))
        {
            ReplyClass::AutoReply
        } else {
            ReplyClass::HumanReply
        };

        Classification {
            class,
            recipient_address: Some(message.from.clone()),
        }
    }

    fn is_bounce(&self, message: &InboundMessage) -> bool {
        if self.bounce_sender.is_match(&message.from) || is_delivery_report(message) {
            return true;
        }
        auto_reply_header(message).is_some()
            && self.bounce_subjects.iter().any(|r| r.is_match(&message.subject))
    }
}

/// Structural DSN markers (RFC 3464), independent of sender and subject.
fn is_delivery_report(message: &InboundMessage) -> bool {
    if message.header("X-Failed-Recipients").is_some() {
        return true;
    }
    message.header("Content-Type").is_some_and(|value| {
        let value = value.to_ascii_lowercase();
        value.contains("multipart/report") || value.contains("delivery-status")
    })
}

/// Name of the first header that marks `message` as machine-generated.
fn auto_reply_header(message: &InboundMessage) -> Option<&'static str> {
    if message
        .header("Auto-Submitted")
        .is_some_and(|v| !v.trim().eq_ignore_ascii_case("no"))
    {
        return Some("Auto-Submitted");
    }
    for name in ["X-Autoreply", "X-Autorespond"] {
        if message.header(name).is_some() {
            return Some(name);
        }
    }
    let precedence = message.header("Precedence").map(|v| v.trim().to_ascii_lowercase());
    if matches!(precedence.as_deref(), Some("auto_reply" | "bulk" | "junk")) {
        return Some("Precedence");
    }
    None
}
