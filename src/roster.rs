//! Bulk recipient import and export as CSV.
//!
//! Import reads a header row with an `email` column; every other non-empty
//! column becomes a template attribute. Rows go through the same enrolment
//! path as single enrolments, so duplicates and bad addresses are reported
//! per row instead of failing the batch.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::RosterError;
use crate::scheduler::{EnrollOutcome, Scheduler};
use crate::sequence::{AttributeValue, Attributes, RecipientRecord};

const EMAIL_COLUMN: &str = "email";

/// Fixed export columns; attribute columns follow in name order.
const EXPORT_COLUMNS: [&str; 9] = [
    "email",
    "stage",
    "stop_reason",
    "stage_sent_at",
    "next_eligible_at",
    "retry_count",
    "last_message_id",
    "created_at",
    "updated_at",
];

/// A row that was not enrolled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    /// 1-based data row number, not counting the header.
    pub row: usize,
    pub email: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub total: usize,
    pub enrolled: usize,
    pub already_enrolled: usize,
    pub rejected: Vec<RejectedRow>,
}

struct ParsedRow {
    row: usize,
    email: String,
    attributes: Attributes,
}

/// Parse the whole input before touching the store, so a malformed file
/// enrols nothing.
fn parse_rows(input: impl Read) -> Result<Vec<ParsedRow>, RosterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();
    let email_index = headers
        .iter()
        .position(|h| h == EMAIL_COLUMN)
        .ok_or(RosterError::MissingColumn(EMAIL_COLUMN))?;

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let attributes = headers
            .iter()
            .zip(record.iter())
            .enumerate()
            .filter(|(index, (name, value))| {
                *index != email_index && !name.is_empty() && !value.is_empty()
            })
            .map(|(_, (name, value))| (name.clone(), AttributeValue::from(value)))
            .collect();
        rows.push(ParsedRow {
            row: i + 1,
            email: record.get(email_index).unwrap_or_default().to_string(),
            attributes,
        });
    }
    Ok(rows)
}

/// Enrol every row of a CSV roster.
pub async fn import_csv(
    scheduler: &Scheduler,
    input: impl Read,
    now: DateTime<Utc>,
) -> Result<ImportReport, RosterError> {
    let rows = parse_rows(input)?;
    let mut report = ImportReport {
        total: rows.len(),
        ..ImportReport::default()
    };

    for row in rows {
        if row.email.is_empty() {
            report.rejected.push(RejectedRow {
                row: row.row,
                email: row.email,
                reason: "missing email".into(),
            });
            continue;
        }
        match scheduler.enroll(&row.email, row.attributes, now).await? {
            EnrollOutcome::Enrolled(_) => report.enrolled += 1,
            EnrollOutcome::AlreadyEnrolled => report.already_enrolled += 1,
            EnrollOutcome::InvalidAddress => report.rejected.push(RejectedRow {
                row: row.row,
                email: row.email,
                reason: "invalid email address".into(),
            }),
        }
    }

    info!(
        total = report.total,
        enrolled = report.enrolled,
        already_enrolled = report.already_enrolled,
        rejected = report.rejected.len(),
        "Roster imported"
    );
    Ok(report)
}

fn ts(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Write `records` as CSV. Returns the number of data rows written.
pub fn write_csv(records: &[RecipientRecord], output: impl Write) -> Result<usize, RosterError> {
    let attribute_columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.attributes.keys().map(String::as_str))
        .filter(|key| !EXPORT_COLUMNS.contains(key))
        .collect();

    let mut writer = csv::Writer::from_writer(output);
    writer.write_record(EXPORT_COLUMNS.iter().chain(attribute_columns.iter()))?;

    for record in records {
        let mut row = vec![
            record.id.as_str().to_string(),
            record.stage.as_str().to_string(),
            record
                .stop_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
            ts(record.stage_sent_at),
            ts(Some(record.next_eligible_at)),
            record.retry_count.to_string(),
            record.last_message_id.clone().unwrap_or_default(),
            ts(Some(record.created_at)),
            ts(Some(record.updated_at)),
        ];
        row.extend(attribute_columns.iter().map(|key| {
            record
                .attributes
                .get(*key)
                .map(ToString::to_string)
                .unwrap_or_default()
        }));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Export every recipient, in enrolment order.
pub async fn export_csv(scheduler: &Scheduler, output: impl Write) -> Result<usize, RosterError> {
    let records = scheduler.recipients().await?;
    write_csv(&records, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{Stage, StopReason};
    use chrono::TimeZone;

    #[test]
    fn parses_email_and_attribute_columns() {
        let input = "\u{feff}First_Name,Email,Company,Role\n\
                     Ada, ada@example.com ,Analytical Engines,\n\
                     ,,,\n\
                     Grace,,Navy,Admiral\n";
        let rows = parse_rows(input.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].row, 1);
        assert_eq!(rows[0].email, "ada@example.com");
        assert_eq!(
            rows[0].attributes.get("company"),
            Some(&AttributeValue::from("Analytical Engines"))
        );
        assert!(!rows[0].attributes.contains_key("role"));
        assert!(!rows[0].attributes.contains_key("email"));

        assert_eq!(rows[1].row, 3);
        assert!(rows[1].email.is_empty());
    }

    #[test]
    fn header_without_email_is_rejected() {
        let err = parse_rows("name,company\nAda,Acme\n".as_bytes())
            .err()
            .unwrap();
        assert!(matches!(err, RosterError::MissingColumn("email")));
    }

    #[test]
    fn export_writes_fixed_then_attribute_columns() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let mut ada = RecipientRecord::enroll(
            "ada@example.com",
            Attributes::from([("company".to_string(), AttributeValue::from("Acme, Ltd"))]),
            now,
            now,
        );
        ada.stage = Stage::Replied;
        ada.stop_reason = Some(StopReason::ReplyDetected);
        let bob = RecipientRecord::enroll(
            "bob@example.com",
            Attributes::from([("first_name".to_string(), AttributeValue::from("Bob"))]),
            now,
            now,
        );

        let mut out = Vec::new();
        assert_eq!(write_csv(&[ada, bob], &mut out).unwrap(), 2);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "email,stage,stop_reason,stage_sent_at,next_eligible_at,retry_count,\
             last_message_id,created_at,updated_at,company,first_name"
        );
        assert_eq!(
            lines[1],
            "ada@example.com,replied,reply_detected,,2026-03-02T10:00:00Z,0,,\
             2026-03-02T10:00:00Z,2026-03-02T10:00:00Z,\"Acme, Ltd\","
        );
        assert!(lines[2].starts_with("bob@example.com,not_started,"));
        assert!(lines[2].ends_with(",,Bob"));
    }
}
