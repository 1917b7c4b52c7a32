//! SQLite schema and connection setup.

use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// Current `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS changes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    binlog_file     TEXT    NOT NULL,
    file_index      INTEGER NOT NULL,
    binlog_pos      INTEGER NOT NULL,
    seq             INTEGER NOT NULL,
    txn_id          TEXT    NOT NULL,
    database_name   TEXT    NOT NULL,
    table_name      TEXT    NOT NULL,
    operation       TEXT    NOT NULL,
    event_ts        INTEGER NOT NULL,
    user_name       TEXT,
    pk_text         TEXT    NOT NULL,
    primary_key     TEXT    NOT NULL,
    before_image    TEXT,
    after_image     TEXT,
    changes         TEXT    NOT NULL,
    ddl             TEXT,
    stored_at       INTEGER NOT NULL,
    UNIQUE (binlog_file, binlog_pos, seq)
);

CREATE INDEX IF NOT EXISTS idx_changes_table_time
    ON changes (database_name, table_name, event_ts);
CREATE INDEX IF NOT EXISTS idx_changes_time ON changes (event_ts);
CREATE INDEX IF NOT EXISTS idx_changes_pk
    ON changes (database_name, table_name, pk_text);

CREATE TRIGGER IF NOT EXISTS changes_no_update
BEFORE UPDATE ON changes
BEGIN
    SELECT RAISE(ABORT, 'changes is append-only');
END;

CREATE TRIGGER IF NOT EXISTS changes_no_delete
BEFORE DELETE ON changes
BEGIN
    SELECT RAISE(ABORT, 'changes is append-only');
END;

CREATE TABLE IF NOT EXISTS alerts (
    id              TEXT    PRIMARY KEY,
    rule_id         TEXT    NOT NULL,
    rule_title      TEXT    NOT NULL,
    severity        TEXT    NOT NULL,
    severity_rank   INTEGER NOT NULL,
    alert_key       TEXT    NOT NULL,
    summary         TEXT    NOT NULL,
    database_name   TEXT,
    table_name      TEXT,
    operation       TEXT,
    event           TEXT,
    window_summary  TEXT,
    channels        TEXT    NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts (created_at);
CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts (rule_id, alert_key);

CREATE TABLE IF NOT EXISTS alert_deliveries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id        TEXT    NOT NULL REFERENCES alerts (id),
    channel         TEXT,
    status          TEXT    NOT NULL,
    attempts        INTEGER NOT NULL,
    error           TEXT,
    recorded_at     INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deliveries_alert ON alert_deliveries (alert_id);

-- Alert status is the latest summary row (channel IS NULL).
CREATE VIEW IF NOT EXISTS alerts_with_status AS
SELECT a.rowid AS row_order,
       a.*,
       COALESCE(
           (SELECT d.status FROM alert_deliveries d
             WHERE d.alert_id = a.id AND d.channel IS NULL
             ORDER BY d.id DESC LIMIT 1),
           'pending') AS delivery_status
  FROM alerts a;

CREATE TABLE IF NOT EXISTS checkpoint (
    slot            INTEGER PRIMARY KEY CHECK (slot = 1),
    binlog_file     TEXT    NOT NULL,
    binlog_pos      INTEGER NOT NULL,
    tx_boundary     INTEGER NOT NULL,
    updated_at      TEXT    NOT NULL
);
"#;

/// Pragmas every connection gets.
pub(crate) fn configure(conn: &Connection, busy_timeout: Duration) -> Result<(), StoreError> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Writer-only setup: WAL, full fsync on commit, schema migration.
pub(crate) fn initialize(conn: &Connection) -> Result<(), StoreError> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(journal_mode = %mode, "WAL not available, falling back");
    }
    conn.pragma_update(None, "synchronous", "FULL")?;

    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Corrupt(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!(from = version, to = SCHEMA_VERSION, "change store schema migrated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("t.db")).unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("t.db")).unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(initialize(&conn), Err(StoreError::Corrupt(_))));
    }
}
