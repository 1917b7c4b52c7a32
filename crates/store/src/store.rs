//! SQLite change store.
//!
//! One writer connection serialises appends; a second connection serves
//! reads so queries never wait behind a batch commit (WAL). The store can
//! also be opened read-only, which is how the CLI inspects a database the
//! daemon is writing.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use binwatch_core::config::StoreConfig;
use binwatch_core::metrics as m;
use binwatch_core::types::{ChangeEvent, Checkpoint, Operation, RowImage, StreamPosition};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, params, params_from_iter};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::position::PositionStore;
use crate::query::{ChangeQuery, DailyCount, StoreStats, TableStats, TableSummary};
use crate::schema;

const EVENT_COLUMNS: &str = "binlog_file, binlog_pos, seq, txn_id, database_name, table_name, \
     operation, event_ts, user_name, primary_key, before_image, after_image, changes, ddl";

const EVENT_ORDER: &str =
    "database_name, table_name, event_ts, file_index, binlog_file, binlog_pos, seq";

const LOG_ORDER: &str = "event_ts, file_index, binlog_file, binlog_pos, seq";

/// Days covered by [`StoreStats::daily`].
const DAILY_WINDOW_DAYS: i64 = 30;

/// Append-only store of change events and alerts, and the default
/// checkpoint slot.
pub struct ChangeStore {
    path: PathBuf,
    writer: Option<Mutex<Connection>>,
    reader: Mutex<Connection>,
}

impl std::fmt::Debug for ChangeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStore")
            .field("path", &self.path)
            .field("read_only", &self.writer.is_none())
            .finish()
    }
}

impl ChangeStore {
    /// Open (creating if needed) the store named by the config.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open_path(&config.path, Duration::from_millis(config.busy_timeout_ms))
    }

    /// Open for writing, creating the file, parent directory and schema.
    pub fn open_path(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let writer = Connection::open(&path)?;
        schema::configure(&writer, busy_timeout)?;
        schema::initialize(&writer)?;

        let reader = Self::open_reader(&path, busy_timeout)?;
        info!(path = %path.display(), "change store opened");
        Ok(Self {
            path,
            writer: Some(Mutex::new(writer)),
            reader: Mutex::new(reader),
        })
    }

    /// Open an existing store without write access.
    pub fn open_read_only(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let reader = Self::open_reader(&path, busy_timeout)?;
        let version: i64 = reader.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version != schema::SCHEMA_VERSION {
            return Err(StoreError::Corrupt(format!(
                "{} has schema version {version}, expected {}",
                path.display(),
                schema::SCHEMA_VERSION
            )));
        }
        Ok(Self {
            path,
            writer: None,
            reader: Mutex::new(reader),
        })
    }

    fn open_reader(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        schema::configure(&conn, busy_timeout)?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.writer.is_none()
    }

    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.writer
            .as_ref()
            .ok_or(StoreError::ReadOnly)?
            .lock()
            .map_err(|_| StoreError::Poisoned)
    }

    pub(crate) fn reader(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.reader.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- changes ---

    /// Append one event. Returns its row id, or `None` if an event with the
    /// same `(position, seq)` is already stored.
    pub fn append_event(&self, event: &ChangeEvent) -> Result<Option<i64>, StoreError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let id = insert_event(&tx, event)?;
        tx.commit()?;
        record_written(usize::from(id.is_some()), usize::from(id.is_none()));
        Ok(id)
    }

    /// Append a committed transaction's events and, optionally, the
    /// checkpoint that follows them, in one SQLite transaction.
    ///
    /// Returns the events that were not already stored, in input order.
    pub fn append_batch(
        &self,
        events: Vec<ChangeEvent>,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let started = Instant::now();
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let total = events.len();
        let mut inserted = Vec::with_capacity(total);
        for event in events {
            if insert_event(&tx, &event)?.is_some() {
                inserted.push(event);
            }
        }
        if let Some(checkpoint) = checkpoint {
            write_checkpoint(&tx, checkpoint)?;
        }
        tx.commit()?;

        let duplicates = total - inserted.len();
        record_written(inserted.len(), duplicates);
        if checkpoint.is_some() {
            metrics::counter!(m::STORE_CHECKPOINTS_TOTAL).increment(1);
        }
        debug!(
            events = total,
            inserted = inserted.len(),
            duplicates,
            checkpoint = checkpoint.map(|c| c.position.to_string()),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch committed"
        );
        Ok(inserted)
    }

    /// Changes matching `query`, ordered by table, time, position and seq.
    pub fn query_changes(&self, query: &ChangeQuery) -> Result<Vec<ChangeEvent>, StoreError> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM changes WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();

        let (database, table) = query.target();
        if let Some(database) = database {
            sql.push_str(" AND database_name = ?");
            args.push(Value::Text(database.to_owned()));
        }
        if let Some(table) = table {
            sql.push_str(" AND table_name = ?");
            args.push(Value::Text(table.to_owned()));
        }
        if let Some(from) = query.from {
            sql.push_str(" AND event_ts >= ?");
            args.push(Value::Integer(from.timestamp()));
        }
        if let Some(to) = query.to {
            sql.push_str(" AND event_ts <= ?");
            args.push(Value::Integer(to.timestamp()));
        }
        if let Some(operation) = query.operation {
            sql.push_str(" AND operation = ?");
            args.push(Value::Text(operation.as_str().to_owned()));
        }
        if let Some(pk) = &query.primary_key {
            sql.push_str(" AND pk_text = ?");
            args.push(Value::Text(pk.clone()));
        }
        sql.push_str(&format!(" ORDER BY {EVENT_ORDER} LIMIT ? OFFSET ?"));
        args.push(Value::Integer(clamp_i64(query.limit)));
        args.push(Value::Integer(clamp_i64(query.offset)));

        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every stored change of one row, oldest first.
    pub fn record_history(
        &self,
        database: &str,
        table: &str,
        primary_key: &str,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM changes \
             WHERE database_name = ?1 AND table_name = ?2 AND pk_text = ?3 \
             ORDER BY {LOG_ORDER}"
        ))?;
        let rows = stmt.query_map(params![database, table, primary_key], event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Events with event time at or after `since`, in log order.
    pub fn recent_events(&self, since: DateTime<Utc>) -> Result<Vec<ChangeEvent>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM changes WHERE event_ts >= ?1 ORDER BY {LOG_ORDER}"
        ))?;
        let rows = stmt.query_map(params![since.timestamp()], event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Distinct databases with stored changes.
    pub fn databases(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn
            .prepare_cached("SELECT DISTINCT database_name FROM changes ORDER BY database_name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Tables with stored changes, optionally within one database.
    pub fn tables(&self, database: Option<&str>) -> Result<Vec<TableSummary>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT database_name, table_name, COUNT(*), MAX(event_ts) FROM changes \
             WHERE ?1 IS NULL OR database_name = ?1 \
             GROUP BY database_name, table_name ORDER BY database_name, table_name",
        )?;
        let rows = stmt.query_map(params![database], |row| {
            Ok(TableSummary {
                database: row.get(0)?,
                table: row.get(1)?,
                changes: row.get::<_, i64>(2)? as u64,
                last_event_at: row
                    .get::<_, Option<i64>>(3)?
                    .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Aggregate counts for dashboards.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.reader()?;
        let mut stats = StoreStats::default();

        let (total, first, last): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(event_ts), MAX(event_ts) FROM changes",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        stats.total_changes = total as u64;
        stats.first_event_at = first.and_then(|ts| DateTime::from_timestamp(ts, 0));
        stats.last_event_at = last.and_then(|ts| DateTime::from_timestamp(ts, 0));

        {
            let mut stmt = conn.prepare_cached(
                "SELECT database_name, table_name, operation, COUNT(*) FROM changes \
                 GROUP BY database_name, table_name, operation \
                 ORDER BY database_name, table_name",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let database: String = row.get(0)?;
                let table: String = row.get(1)?;
                let operation: String = row.get(2)?;
                let count = row.get::<_, i64>(3)? as u64;

                *stats.by_operation.entry(operation.clone()).or_default() += count;
                let same_table = matches!(
                    stats.by_table.last(),
                    Some(t) if t.database == database && t.table == table
                );
                if !same_table {
                    stats.by_table.push(TableStats {
                        database,
                        table,
                        ..Default::default()
                    });
                }
                let Some(entry) = stats.by_table.last_mut() else {
                    continue;
                };
                match Operation::from_str_loose(&operation) {
                    Some(Operation::Insert) => entry.inserts += count,
                    Some(Operation::Update) => entry.updates += count,
                    Some(Operation::Delete) => entry.deletes += count,
                    Some(Operation::Ddl) => entry.ddl += count,
                    None => {}
                }
                entry.total += count;
            }
        }

        {
            let since = Utc::now().timestamp() - DAILY_WINDOW_DAYS * 86_400;
            let mut stmt = conn.prepare_cached(
                "SELECT date(event_ts, 'unixepoch') AS day, COUNT(*) FROM changes \
                 WHERE event_ts >= ?1 GROUP BY day ORDER BY day",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                Ok(DailyCount {
                    date: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?;
            stats.daily = rows.collect::<Result<Vec<_>, _>>()?;
        }

        stats.total_alerts =
            conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get::<_, i64>(0))? as u64;
        stats.alerts_by_severity = grouped_counts(
            &conn,
            "SELECT severity, COUNT(*) FROM alerts GROUP BY severity",
        )?;
        stats.alerts_by_status = grouped_counts(
            &conn,
            "SELECT delivery_status, COUNT(*) FROM alerts_with_status GROUP BY delivery_status",
        )?;
        Ok(stats)
    }
}

impl PositionStore for ChangeStore {
    fn load(&self) -> Result<Option<Checkpoint>, StoreError> {
        let conn = self.reader()?;
        let row = conn
            .query_row(
                "SELECT binlog_file, binlog_pos, tx_boundary, updated_at FROM checkpoint \
                 WHERE slot = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((file, offset, tx_boundary, updated_at)) = row else {
            return Ok(None);
        };
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| StoreError::Corrupt(format!("checkpoint timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(Some(Checkpoint {
            position: StreamPosition::new(file, offset as u64),
            tx_boundary,
            updated_at,
        }))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        write_checkpoint(&tx, checkpoint)?;
        tx.commit()?;
        metrics::counter!(m::STORE_CHECKPOINTS_TOTAL).increment(1);
        Ok(())
    }
}

fn insert_event(tx: &Transaction<'_>, event: &ChangeEvent) -> Result<Option<i64>, StoreError> {
    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO changes (binlog_file, file_index, binlog_pos, seq, txn_id, \
         database_name, table_name, operation, event_ts, user_name, pk_text, primary_key, \
         before_image, after_image, changes, ddl, stored_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
    )?;
    let inserted = stmt.execute(params![
        event.position.file,
        event.position.file_index().map_or(0, |i| i as i64),
        event.position.offset as i64,
        event.seq,
        event.txn_id,
        event.database,
        event.table,
        event.operation.as_str(),
        event.timestamp.timestamp(),
        event.user,
        pk_text(&event.primary_key),
        serde_json::to_string(&event.primary_key)?,
        event.before.as_ref().map(serde_json::to_string).transpose()?,
        event.after.as_ref().map(serde_json::to_string).transpose()?,
        serde_json::to_string(&event.changes)?,
        event.ddl.as_ref().map(serde_json::to_string).transpose()?,
        Utc::now().timestamp_millis(),
    ])?;
    Ok((inserted == 1).then(|| tx.last_insert_rowid()))
}

fn write_checkpoint(tx: &Transaction<'_>, checkpoint: &Checkpoint) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO checkpoint (slot, binlog_file, binlog_pos, tx_boundary, updated_at) \
         VALUES (1, ?1, ?2, ?3, ?4) \
         ON CONFLICT (slot) DO UPDATE SET binlog_file = excluded.binlog_file, \
         binlog_pos = excluded.binlog_pos, tx_boundary = excluded.tx_boundary, \
         updated_at = excluded.updated_at",
        params![
            checkpoint.position.file,
            checkpoint.position.offset as i64,
            checkpoint.tx_boundary,
            checkpoint.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn record_written(inserted: usize, duplicates: usize) {
    metrics::counter!(m::STORE_EVENTS_WRITTEN_TOTAL).increment(inserted as u64);
    if duplicates > 0 {
        metrics::counter!(m::STORE_DUPLICATES_TOTAL).increment(duplicates as u64);
    }
}

/// Primary key values joined by `,`; strings unquoted.
pub fn pk_text(key: &RowImage) -> String {
    key.values()
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn clamp_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn grouped_counts(
    conn: &Connection,
    sql: &str,
) -> Result<std::collections::BTreeMap<String, u64>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn conversion_error(idx: usize, reason: impl Into<String>) -> rusqlite::Error {
    let reason: String = reason.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, reason.into())
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeEvent> {
    let operation: String = row.get(6)?;
    let operation = Operation::from_str_loose(&operation)
        .ok_or_else(|| conversion_error(6, format!("unknown operation {operation}")))?;
    let ts: i64 = row.get(7)?;
    let timestamp = DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| conversion_error(7, format!("timestamp {ts} out of range")))?;

    Ok(ChangeEvent {
        position: StreamPosition::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64),
        seq: row.get(2)?,
        txn_id: row.get(3)?,
        database: row.get(4)?,
        table: row.get(5)?,
        operation,
        timestamp,
        user: row.get(8)?,
        primary_key: json_column(row, 9)?,
        before: opt_json_column(row, 10)?,
        after: opt_json_column(row, 11)?,
        changes: json_column(row, 12)?,
        ddl: opt_json_column(row, 13)?,
        committed: true,
    })
}
