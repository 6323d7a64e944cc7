//! Schema versions for the sequencer database, applied in order at startup.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; versions are never renumbered.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                stage TEXT NOT NULL DEFAULT 'not_started',
                stage_sent_at TEXT,
                next_eligible_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                backoff_until TEXT,
                stop_reason TEXT,
                last_message_id TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_stage ON recipients(stage);
            CREATE INDEX IF NOT EXISTS idx_recipients_next_eligible ON recipients(next_eligible_at);

            CREATE TABLE IF NOT EXISTS processed_messages (
                message_id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL,
                classification TEXT NOT NULL,
                received_at TEXT NOT NULL,
                processed_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_processed_messages_recipient
                ON processed_messages(recipient_id);
        "#,
    },
    Migration {
        version: 2,
        name: "recipient_message_lookup",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_recipients_last_message ON recipients(last_message_id);
        "#,
    },
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Bring the schema up to the newest version. Each step commits together
/// with its version row, so a failed step leaves the previous version intact.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(VERSION_TABLE, ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("schema_version table: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    let Some(target) = pending.last().map(|m| m.version) else {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    };

    for migration in pending {
        apply(conn, migration).await?;
    }
    tracing::info!(from = applied, to = target, "Schema migrated");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {}: {e}", migration.version, migration.name))
    };

    let tx = conn.transaction().await.map_err(failed)?;
    tx.execute_batch(migration.sql).await.map_err(failed)?;
    tx.execute(
        "INSERT INTO schema_version (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(failed)?;
    tx.commit().await.map_err(failed)?;

    tracing::debug!(version = migration.version, name = migration.name, "Migration applied");
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read_failed = |e: libsql::Error| DatabaseError::Migration(format!("schema_version read: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(read_failed)?;
    match rows.next().await.map_err(read_failed)? {
        Some(row) => row.get::<i64>(0).map_err(read_failed),
        None => Ok(0),
    }
}
