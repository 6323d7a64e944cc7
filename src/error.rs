//! Error types for the sequencer.
//!
//! Per-send outcomes are not errors: see `dispatch::DispatchOutcome`.
//! Lost state-transition races are not errors either: see `store::WriteOutcome`.

use std::time::Duration;

/// Configuration errors. Only ever produced at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Invalid stage transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox read failures. Treated as transient at the sweep level.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox {backend} unreachable: {reason}")]
    Unreachable { backend: String, reason: String },

    #[error("Mailbox {backend} fetch timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Mailbox {backend} authentication failed")]
    AuthFailed { backend: String },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },
}

/// Template rendering failures.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("No template for stage {stage}")]
    MissingTemplate { stage: u8 },

    #[error("Template for stage {stage} references unknown attribute {key}")]
    MissingAttribute { stage: u8, key: String },

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bulk CSV import and export failures. Bad rows are not errors: they are
/// counted in the import report.
#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV header has no {0} column")]
    MissingColumn(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
