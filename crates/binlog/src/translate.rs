//! Decoded events → [`StreamRecord`]s.
//!
//! Tracks the current log file and offset, the pending GTID and the open
//! transaction so every record carries a real position and transaction id.

use binwatch_core::ddl::{self, StatementKind};
use binwatch_core::event::StreamRecord;
use binwatch_core::metrics as m;
use binwatch_core::types::{DdlInfo, Operation, RawMutation, StreamPosition};
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, warn};

use crate::decoder::{BinlogEvent, EventHeader, QueryEvent, RowsEvent};

#[derive(Debug, Clone)]
struct OpenTxn {
    id: String,
    user: Option<String>,
}

/// Stateful translator for one replication stream.
#[derive(Debug)]
pub struct Translator {
    file: String,
    offset: u64,
    pending_gtid: Option<String>,
    txn: Option<OpenTxn>,
}

impl Translator {
    pub fn new(start: &StreamPosition) -> Self {
        Self {
            file: start.file.clone(),
            offset: start.offset,
            pending_gtid: None,
            txn: None,
        }
    }

    /// Position after the last event seen.
    pub fn position(&self) -> StreamPosition {
        StreamPosition::new(self.file.clone(), self.offset)
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Translate one event. Most events yield zero or one record; a rows
    /// event yields one record per row.
    pub fn translate(&mut self, header: &EventHeader, event: BinlogEvent) -> Vec<StreamRecord> {
        let start = StreamPosition::new(self.file.clone(), header.start_position());
        if !header.is_artificial() {
            self.offset = u64::from(header.next_position);
        }
        let position = self.position();
        let timestamp = timestamp(header.timestamp);

        match event {
            BinlogEvent::Rotate {
                next_file,
                position: offset,
            } => {
                self.file = next_file;
                self.offset = offset;
                vec![StreamRecord::Rotate {
                    position: self.position(),
                }]
            }
            BinlogEvent::Gtid(gtid) => {
                self.pending_gtid = Some(gtid);
                Vec::new()
            }
            BinlogEvent::AnonymousGtid => {
                self.pending_gtid = None;
                Vec::new()
            }
            BinlogEvent::Query(query) => self.query(query, start, position, timestamp),
            BinlogEvent::Xid(_) => self.commit(position, timestamp),
            BinlogEvent::Rows(rows) => self.rows(rows, position, timestamp),
            BinlogEvent::Heartbeat => vec![StreamRecord::Heartbeat { position }],
            BinlogEvent::FormatDescription { .. }
            | BinlogEvent::TableMap { .. }
            | BinlogEvent::Ignored(_) => Vec::new(),
        }
    }

    fn query(
        &mut self,
        query: QueryEvent,
        start: StreamPosition,
        position: StreamPosition,
        timestamp: DateTime<Utc>,
    ) -> Vec<StreamRecord> {
        match ddl::classify(&query.statement) {
            StatementKind::Begin => {
                let id = self.pending_gtid.take().unwrap_or_else(|| start.to_string());
                if let Some(open) = self.txn.replace(OpenTxn {
                    id: id.clone(),
                    user: query.invoker,
                }) {
                    warn!(txn_id = %open.id, position = %start, "BEGIN inside an open transaction");
                }
                vec![StreamRecord::Begin {
                    txn_id: id,
                    position,
                    timestamp,
                }]
            }
            StatementKind::Commit => self.commit(position, timestamp),
            StatementKind::Rollback => match self.txn.take() {
                Some(open) => vec![StreamRecord::Rollback {
                    txn_id: open.id,
                    position,
                }],
                None => Vec::new(),
            },
            StatementKind::Ddl(target) => {
                let txn_id = self.pending_gtid.take().unwrap_or_else(|| start.to_string());
                let database = target.database.clone().unwrap_or(query.schema);
                let table = target.table.clone().unwrap_or_default();
                debug!(
                    database = %database,
                    table = %table,
                    kind = ?target.kind,
                    parsed = target.parsed,
                    "DDL statement"
                );
                vec![StreamRecord::Mutation(RawMutation {
                    operation: Operation::Ddl,
                    database,
                    table,
                    before: None,
                    after: None,
                    position,
                    txn_id,
                    timestamp,
                    user: query.invoker,
                    ddl: Some(DdlInfo {
                        statement: query.statement,
                        kind: Some(target.kind),
                        parsed: target.parsed,
                    }),
                })]
            }
            StatementKind::Other => {
                if is_statement_dml(&query.statement) {
                    counter!(m::READER_STATEMENT_EVENTS_SKIPPED_TOTAL).increment(1);
                    warn!(
                        position = %start,
                        schema = %query.schema,
                        "statement-format DML skipped; no row images available"
                    );
                }
                Vec::new()
            }
        }
    }

    fn commit(&mut self, position: StreamPosition, timestamp: DateTime<Utc>) -> Vec<StreamRecord> {
        match self.txn.take() {
            Some(open) => vec![StreamRecord::Commit {
                txn_id: open.id,
                position,
                timestamp,
            }],
            None => {
                debug!(position = %position, "commit without open transaction");
                Vec::new()
            }
        }
    }

    fn rows(
        &mut self,
        rows: RowsEvent,
        position: StreamPosition,
        timestamp: DateTime<Utc>,
    ) -> Vec<StreamRecord> {
        let (txn_id, user) = match &self.txn {
            Some(open) => (open.id.clone(), open.user.clone()),
            None => {
                warn!(position = %position, "row event outside a transaction");
                (position.to_string(), None)
            }
        };
        rows.rows
            .into_iter()
            .map(|row| {
                StreamRecord::Mutation(RawMutation {
                    operation: rows.operation,
                    database: rows.database.clone(),
                    table: rows.table.clone(),
                    before: row.before,
                    after: row.after,
                    position: position.clone(),
                    txn_id: txn_id.clone(),
                    timestamp,
                    user: user.clone(),
                    ddl: None,
                })
            })
            .collect()
    }
}

fn timestamp(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_else(Utc::now)
}

fn is_statement_dml(statement: &str) -> bool {
    let first = statement
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default();
    ["INSERT", "UPDATE", "DELETE", "REPLACE", "LOAD"]
        .iter()
        .any(|kw| first.eq_ignore_ascii_case(kw))
}

#[cfg(test)]
mod tests {
    use binwatch_core::types::RowImage;
    use serde_json::json;

    use super::*;
    use crate::decoder::RowChange;

    fn header(event_type: u8, next_position: u32, event_length: u32) -> EventHeader {
        EventHeader {
            timestamp: 1_700_000_000,
            event_type,
            server_id: 1,
            event_length,
            next_position,
            flags: 0,
        }
    }

    fn query(statement: &str) -> BinlogEvent {
        BinlogEvent::Query(QueryEvent {
            thread_id: 9,
            error_code: 0,
            schema: "shop".to_owned(),
            statement: statement.to_owned(),
            invoker: None,
        })
    }

    fn insert(id: i64) -> BinlogEvent {
        let mut after = RowImage::new();
        after.insert("id".to_owned(), json!(id));
        BinlogEvent::Rows(RowsEvent {
            table_id: 70,
            operation: Operation::Insert,
            database: "shop".to_owned(),
            table: "orders".to_owned(),
            rows: vec![RowChange {
                before: None,
                after: Some(after),
            }],
        })
    }

    #[test]
    fn transaction_with_gtid_id() {
        let mut t = Translator::new(&StreamPosition::new("mysql-bin.000001", 4));
        assert!(t.translate(&header(33, 200, 65), BinlogEvent::Gtid("uuid:7".to_owned())).is_empty());

        let begin = t.translate(&header(2, 280, 80), query("BEGIN"));
        assert!(matches!(&begin[0], StreamRecord::Begin { txn_id, .. } if txn_id == "uuid:7"));
        assert!(t.in_transaction());

        let rows = t.translate(&header(30, 400, 60), insert(1));
        match &rows[0] {
            StreamRecord::Mutation(m) => {
                assert_eq!(m.txn_id, "uuid:7");
                assert_eq!(m.position, StreamPosition::new("mysql-bin.000001", 400));
                assert_eq!(m.qualified_table(), "shop.orders");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let commit = t.translate(&header(16, 431, 31), BinlogEvent::Xid(5));
        match &commit[0] {
            StreamRecord::Commit { txn_id, position, .. } => {
                assert_eq!(txn_id, "uuid:7");
                assert_eq!(position.offset, 431);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!t.in_transaction());
    }

    #[test]
    fn transaction_without_gtid_uses_begin_position() {
        let mut t = Translator::new(&StreamPosition::new("mysql-bin.000001", 4));
        let begin = t.translate(&header(2, 300, 80), query("BEGIN"));
        assert!(matches!(
            &begin[0],
            StreamRecord::Begin { txn_id, .. } if txn_id == "mysql-bin.000001:220"
        ));
    }

    #[test]
    fn rollback_closes_transaction() {
        let mut t = Translator::new(&StreamPosition::new("mysql-bin.000001", 4));
        t.translate(&header(2, 300, 80), query("BEGIN"));
        let out = t.translate(&header(2, 380, 80), query("ROLLBACK"));
        assert!(matches!(out[0], StreamRecord::Rollback { .. }));
        assert!(!t.in_transaction());
    }

    #[test]
    fn ddl_uses_session_schema_when_unqualified() {
        let mut t = Translator::new(&StreamPosition::new("mysql-bin.000001", 4));
        let out = t.translate(&header(2, 500, 120), query("ALTER TABLE orders ADD COLUMN note TEXT"));
        match &out[0] {
            StreamRecord::Mutation(m) => {
                assert_eq!(m.operation, Operation::Ddl);
                assert_eq!(m.database, "shop");
                assert_eq!(m.table, "orders");
                assert!(m.ddl.as_ref().is_some_and(|d| d.parsed));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn statement_dml_is_skipped() {
        let mut t = Translator::new(&StreamPosition::new("mysql-bin.000001", 4));
        assert!(t.translate(&header(2, 500, 120), query("INSERT INTO orders VALUES (1)")).is_empty());
        assert!(is_statement_dml("  delete from t"));
        assert!(!is_statement_dml("SAVEPOINT a"));
    }

    #[test]
    fn rotate_switches_file() {
        let mut t = Translator::new(&StreamPosition::new("mysql-bin.000001", 900));
        let out = t.translate(
            &header(4, 950, 50),
            BinlogEvent::Rotate {
                next_file: "mysql-bin.000002".to_owned(),
                position: 4,
            },
        );
        assert_eq!(out[0].position(), &StreamPosition::new("mysql-bin.000002", 4));
        assert_eq!(t.position(), StreamPosition::new("mysql-bin.000002", 4));
    }

    #[test]
    fn artificial_events_do_not_move_offset() {
        let mut t = Translator::new(&StreamPosition::new("mysql-bin.000001", 700));
        let mut h = header(27, 0, 40);
        h.flags = crate::decoder::LOG_EVENT_ARTIFICIAL_F;
        let out = t.translate(&h, BinlogEvent::Heartbeat);
        assert_eq!(out[0].position().offset, 700);
    }
}
