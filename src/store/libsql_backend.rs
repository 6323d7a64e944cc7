//! libSQL backend: async `SequenceRepository` implementation.
//!
//! Conditional writes are single `UPDATE ... WHERE stage = ?` statements, so
//! the row-count tells us whether the precondition held.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::sequence::{Attributes, RecipientId, RecipientRecord, Stage, StopReason};
use crate::store::migrations;
use crate::store::traits::{
    Expected, ProcessedMessage, SequenceRepository, StageAdvance, StatusCounts, WriteOutcome,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text comparison in SQL orders correctly.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, libsql::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| libsql::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, libsql::Error> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn conversion_error(message: String) -> libsql::Error {
    libsql::Error::ToSqlConversionFailure(message.into())
}

const ACTIVE_STAGES_SQL: &str =
    "('not_started', 'initial_sent', 'follow_up_1_sent', 'follow_up_2_sent')";

const RECIPIENT_COLUMNS: &str = "id, stage, stage_sent_at, next_eligible_at, retry_count, backoff_until, stop_reason, last_message_id, attributes, created_at, updated_at";

/// Next row of a result set. A fetch error fails the whole read rather than
/// ending it early with partial results.
async fn next_row(rows: &mut libsql::Rows, op: &str) -> Result<Option<libsql::Row>, DatabaseError> {
    rows.next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
}

/// Map a libsql Row to a RecipientRecord. Column order matches RECIPIENT_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<RecipientRecord, libsql::Error> {
    let id: String = row.get(0)?;
    let stage_str: String = row.get(1)?;
    let stage_sent_str: Option<String> = row.get::<String>(2).ok();
    let next_eligible_str: String = row.get(3)?;
    let retry_count: i64 = row.get(4)?;
    let backoff_str: Option<String> = row.get::<String>(5).ok();
    let stop_reason_str: Option<String> = row.get::<String>(6).ok();
    let last_message_id: Option<String> = row.get::<String>(7).ok();
    let attributes_str: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    let stage: Stage = stage_str.parse().map_err(conversion_error)?;
    let stop_reason = stop_reason_str
        .map(|s| s.parse::<StopReason>())
        .transpose()
        .map_err(conversion_error)?;
    let attributes: Attributes = serde_json::from_str(&attributes_str)
        .map_err(|e| libsql::Error::ToSqlConversionFailure(Box::new(e)))?;

    Ok(RecipientRecord {
        id: RecipientId::new(&id),
        stage,
        stage_sent_at: parse_optional_datetime(stage_sent_str)?,
        next_eligible_at: parse_datetime(&next_eligible_str)?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        backoff_until: parse_optional_datetime(backoff_str)?,
        stop_reason,
        last_message_id,
        attributes,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
    })
}

fn outcome(rows_affected: u64) -> WriteOutcome {
    if rows_affected > 0 {
        WriteOutcome::Applied
    } else {
        WriteOutcome::Stale
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl SequenceRepository for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn enroll(&self, record: &RecipientRecord) -> Result<bool, DatabaseError> {
        let attributes = serde_json::to_string(&record.attributes)
            .map_err(|e| DatabaseError::Serialization(format!("attributes: {e}")))?;

        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO recipients (id, stage, stage_sent_at, next_eligible_at, retry_count, backoff_until, stop_reason, last_message_id, attributes, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id.as_str(),
                    record.stage.as_str(),
                    opt_text(record.stage_sent_at.map(fmt_ts)),
                    fmt_ts(record.next_eligible_at),
                    i64::from(record.retry_count),
                    opt_text(record.backoff_until.map(fmt_ts)),
                    opt_text(record.stop_reason.map(|r| r.as_str().to_string())),
                    opt_text(record.last_message_id.clone()),
                    attributes,
                    fmt_ts(record.created_at),
                    fmt_ts(record.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enroll: {e}")))?;

        debug!(recipient = %record.id, inserted = inserted > 0, "Enroll");
        Ok(inserted > 0)
    }

    async fn get(&self, id: &RecipientId) -> Result<Option<RecipientRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE id = ?1"),
                params![id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_record(&row)
                    .map_err(|e| DatabaseError::Serialization(format!("get row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get: {e}"))),
        }
    }

    async fn due_recipients(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecipientRecord>, DatabaseError> {
        let now = fmt_ts(now);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM recipients \
                     WHERE stage IN {ACTIVE_STAGES_SQL} \
                       AND next_eligible_at <= ?1 \
                       AND (backoff_until IS NULL OR backoff_until <= ?1) \
                     ORDER BY next_eligible_at ASC, id ASC"
                ),
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_recipients: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = next_row(&mut rows, "due_recipients").await? {
            match row_to_record(&row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("Skipping recipient row: {e}");
                }
            }
        }
        Ok(records)
    }

    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<RecipientRecord>, DatabaseError> {
        let bare = message_id.trim().trim_start_matches('<').trim_end_matches('>');
        if bare.is_empty() {
            return Ok(None);
        }
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM recipients \
                     WHERE last_message_id IN (?1, ?2) \
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![bare, format!("<{bare}>")],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_message_id: {e}")))?;

        match next_row(&mut rows, "find_by_message_id").await? {
            Some(row) => row_to_record(&row).map(Some).map_err(|e| {
                DatabaseError::Serialization(format!("find_by_message_id row parse: {e}"))
            }),
            None => Ok(None),
        }
    }

    async fn list_recipients(&self) -> Result<Vec<RecipientRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM recipients ORDER BY created_at ASC, id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recipients: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = next_row(&mut rows, "list_recipients").await? {
            let record = row_to_record(&row)
                .map_err(|e| DatabaseError::Serialization(format!("list_recipients row parse: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }

    async fn advance_stage(
        &self,
        id: &RecipientId,
        advance: &StageAdvance,
    ) -> Result<WriteOutcome, DatabaseError> {
        if !advance.from.can_transition_to(advance.to) || advance.to.is_terminal() {
            return Err(DatabaseError::InvalidTransition {
                id: id.to_string(),
                from: advance.from.to_string(),
                to: advance.to.to_string(),
            });
        }

        let affected = self
            .conn()
            .execute(
                "UPDATE recipients SET stage = ?1, stage_sent_at = ?2, next_eligible_at = ?3, \
                 retry_count = 0, backoff_until = NULL, \
                 last_message_id = COALESCE(?4, last_message_id), updated_at = ?5 \
                 WHERE id = ?6 AND stage = ?7",
                params![
                    advance.to.as_str(),
                    fmt_ts(advance.sent_at),
                    fmt_ts(advance.next_eligible_at),
                    opt_text(advance.message_id.clone()),
                    fmt_ts(Utc::now()),
                    id.as_str(),
                    advance.from.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_stage: {e}")))?;

        Ok(outcome(affected))
    }

    async fn mark_terminal(
        &self,
        id: &RecipientId,
        expected: Expected,
        reason: StopReason,
    ) -> Result<WriteOutcome, DatabaseError> {
        let target = reason.terminal_stage();
        let now = fmt_ts(Utc::now());

        let affected = match expected {
            Expected::Stage(stage) => {
                if !stage.can_transition_to(target) {
                    return Ok(WriteOutcome::Stale);
                }
                self.conn()
                    .execute(
                        "UPDATE recipients SET stage = ?1, stop_reason = ?2, backoff_until = NULL, \
                         updated_at = ?3 WHERE id = ?4 AND stage = ?5",
                        params![target.as_str(), reason.as_str(), now, id.as_str(), stage.as_str()],
                    )
                    .await
            }
            Expected::AnyActive => {
                self.conn()
                    .execute(
                        &format!(
                            "UPDATE recipients SET stage = ?1, stop_reason = ?2, backoff_until = NULL, \
                             updated_at = ?3 WHERE id = ?4 AND stage IN {ACTIVE_STAGES_SQL}"
                        ),
                        params![target.as_str(), reason.as_str(), now, id.as_str()],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("mark_terminal: {e}")))?;

        Ok(outcome(affected))
    }

    async fn increment_retry(
        &self,
        id: &RecipientId,
        expected: Stage,
        backoff_until: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError> {
        if expected.is_terminal() {
            return Ok(None);
        }

        let mut rows = self
            .conn()
            .query(
                "UPDATE recipients SET retry_count = retry_count + 1, backoff_until = ?1, \
                 updated_at = ?2 WHERE id = ?3 AND stage = ?4 RETURNING retry_count",
                params![
                    fmt_ts(backoff_until),
                    fmt_ts(Utc::now()),
                    id.as_str(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_retry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("increment_retry: {e}")))?;
                Ok(Some(u32::try_from(count).unwrap_or(u32::MAX)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("increment_retry: {e}"))),
        }
    }

    async fn is_message_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_message_processed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_message_processed: {e}"))),
        }
    }

    async fn record_processed_message(
        &self,
        message: &ProcessedMessage,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO processed_messages (message_id, recipient_id, classification, received_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.message_id.as_str(),
                    message.recipient.as_str(),
                    message.class.as_str(),
                    fmt_ts(message.received_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_processed_message: {e}")))?;

        Ok(inserted > 0)
    }

    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT stage, stop_reason, COUNT(*) FROM recipients GROUP BY stage, stop_reason",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;

        let mut counts = StatusCounts::default();
        while let Some(row) = next_row(&mut rows, "status_counts").await? {
            let stage_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;
            let reason_str: Option<String> = row.get::<String>(1).ok();
            let count: i64 = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;
            let count = u64::try_from(count).unwrap_or(0);

            let stage: Stage = stage_str.parse().map_err(DatabaseError::Serialization)?;
            *counts.stages.entry(stage).or_insert(0) += count;

            if let Some(reason) = reason_str {
                let reason: StopReason = reason.parse().map_err(DatabaseError::Serialization)?;
                *counts.stop_reasons.entry(reason).or_insert(0) += count;
            }
        }
        Ok(counts)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
