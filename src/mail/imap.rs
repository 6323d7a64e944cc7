//! Inbox reader over raw IMAP + rustls.
//!
//! Opens the mailbox read-only (`EXAMINE`), searches by date and fetches
//! headers only. Nothing is flagged or moved. Arrival time comes from the
//! server's `INTERNALDATE`; the sender's `Date` header is only a fallback.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};

use crate::error::MailboxError;
use crate::mail::{InboundMessage, MailboxReader, bare_address};

const BACKEND: &str = "imap";

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub timeout: Duration,
}

pub struct ImapMailboxReader {
    config: ImapConfig,
}

impl ImapMailboxReader {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxReader for ImapMailboxReader {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn fetch_new_messages(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, MailboxError> {
        let config = self.config.clone();
        let fetch = tokio::task::spawn_blocking(move || fetch_headers_since(&config, since));

        // The socket timeout bounds each read; this bounds the whole session.
        let session_timeout = self.config.timeout * 4;
        match tokio::time::timeout(session_timeout, fetch).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MailboxError::Unreachable {
                backend: BACKEND.into(),
                reason: format!("IMAP task failed: {e}"),
            }),
            Err(_) => Err(MailboxError::Timeout {
                backend: BACKEND.into(),
                timeout: session_timeout,
            }),
        }
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn unreachable(reason: impl std::fmt::Display) -> MailboxError {
    MailboxError::Unreachable {
        backend: BACKEND.into(),
        reason: reason.to_string(),
    }
}

/// One blocking IMAP session. Run inside `spawn_blocking`.
fn fetch_headers_since(
    config: &ImapConfig,
    since: DateTime<Utc>,
) -> Result<Vec<InboundMessage>, MailboxError> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(unreachable)?;
    tcp.set_read_timeout(Some(config.timeout)).map_err(unreachable)?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
        .map_err(unreachable)?;
    let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(unreachable)?;
    let mut session = ImapSession {
        tls: rustls::StreamOwned::new(conn, tcp),
        next_tag: 1,
    };

    let _greeting = session.read_line()?;

    let login = session.command(&format!(
        "LOGIN \"{}\" \"{}\"",
        quote_escape(&config.username),
        quote_escape(config.password.expose_secret())
    ))?;
    if !is_tagged_ok(&login) {
        return Err(MailboxError::AuthFailed {
            backend: BACKEND.into(),
        });
    }

    let examine = session.command("EXAMINE \"INBOX\"")?;
    if !is_tagged_ok(&examine) {
        return Err(unreachable("EXAMINE INBOX failed"));
    }

    let search = session.command(&format!("SEARCH SINCE {}", imap_date(since)))?;
    let ids = parse_search_response(&search);

    let mut messages = Vec::with_capacity(ids.len());
    for id in &ids {
        let fetched = session.command(&format!("FETCH {id} (INTERNALDATE BODY.PEEK[HEADER])"))?;
        match parse_header_block(&literal_body(&fetched), internal_date(&fetched)) {
            Some(message) => messages.push(message),
            None => tracing::debug!(id = %id, "Skipping unparseable message headers"),
        }
    }

    let _ = session.command("LOGOUT");
    Ok(messages)
}

struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(unreachable("IMAP connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(unreachable(e)),
            }
        }
    }

    /// Send a tagged command and collect lines through the tagged response.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.tls
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .map_err(unreachable)?;
        self.tls.flush().map_err(unreachable)?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&format!("{tag} "));
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }
}

fn quote_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn is_tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .and_then(|l| l.split_whitespace().nth(1))
        .is_some_and(|status| status.eq_ignore_ascii_case("OK"))
}

/// IMAP `date` syntax: `18-Oct-2026`.
fn imap_date(ts: DateTime<Utc>) -> String {
    ts.format("%d-%b-%Y").to_string()
}

fn parse_search_response(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| line.starts_with("* SEARCH"))
        .flat_map(|line| line.split_whitespace().skip(2))
        .map(str::to_string)
        .collect()
}

/// The literal between the untagged FETCH line and the closing paren.
fn literal_body(lines: &[String]) -> String {
    let end = lines.len().saturating_sub(1);
    let mut body: Vec<&str> = lines
        .iter()
        .take(end)
        .skip(1)
        .map(String::as_str)
        .collect();
    if body
        .last()
        .is_some_and(|l| l.trim() == ")" || l.contains("INTERNALDATE \""))
    {
        body.pop();
    }
    body.concat()
}

/// `INTERNALDATE "02-Mar-2026 10:15:00 +0000"` from a FETCH response.
/// Servers may place it before or after the header literal.
fn internal_date(lines: &[String]) -> Option<DateTime<Utc>> {
    let closing = lines.len().checked_sub(2).and_then(|i| lines.get(i));
    lines.first().into_iter().chain(closing).find_map(|line| {
        let (_, rest) = line.split_once("INTERNALDATE \"")?;
        let (value, _) = rest.split_once('"')?;
        DateTime::parse_from_str(value.trim(), "%d-%b-%Y %H:%M:%S %z")
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    })
}

fn content_type_text(ct: &mail_parser::ContentType<'_>) -> String {
    let mut text = match ct.subtype() {
        Some(subtype) => format!("{}/{subtype}", ct.ctype()),
        None => ct.ctype().to_string(),
    };
    if let Some(report_type) = ct.attribute("report-type") {
        text.push_str(&format!("; report-type={report_type}"));
    }
    text
}

fn parse_header_block(raw: &str, internal_date: Option<DateTime<Utc>>) -> Option<InboundMessage> {
    let parsed = MessageParser::default().parse_headers(raw.as_bytes())?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(bare_address)?;

    let headers = parsed
        .headers()
        .iter()
        .filter_map(|h| {
            // In-Reply-To and References parse into id lists.
            let value = h
                .value()
                .as_text_list()
                .map(|values| values.join(" "))
                .or_else(|| h.value().as_content_type().map(content_type_text))?;
            Some((h.name().to_string(), value))
        })
        .collect();

    // The Date header is sender-controlled; never let it claim the future.
    let now = Utc::now();
    let received_at = internal_date.unwrap_or_else(|| {
        parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .map_or(now, |date| date.min(now))
    });

    let message_id = parsed
        .message_id()
        .map(|id| format!("<{id}>"))
        .unwrap_or_else(|| format!("{from}@{}", received_at.timestamp()));

    Some(InboundMessage {
        message_id,
        from,
        subject: parsed.subject().unwrap_or_default().to_string(),
        headers,
        received_at,
    })
}
