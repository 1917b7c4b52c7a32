//! Event normalizer: turns the ordered record stream into committed
//! transaction batches.
//!
//! MySQL writes transactions serially, so at most one transaction is open
//! at a time. Admitted rows are buffered until the commit marker; a
//! rollback or a reconnect discards them. DDL is logged outside any
//! transaction and becomes a batch of its own.

use binwatch_core::event::{StreamRecord, TransactionBatch};
use binwatch_core::metrics as m;
use binwatch_core::types::{Operation, RawMutation, StreamPosition};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tracing::{debug, warn};

use crate::error::CdcError;
use crate::scope::{Admitted, ScopeFilter};

#[derive(Debug)]
struct OpenTransaction {
    txn_id: String,
    begin_position: StreamPosition,
    rows: Vec<Admitted>,
    /// Rows read, admitted or not.
    seen: usize,
}

/// Per-connection transaction assembler.
#[derive(Debug)]
pub struct Normalizer {
    max_rows: usize,
    open: Option<OpenTransaction>,
}

impl Normalizer {
    /// `max_rows` bounds the admitted rows buffered for one transaction.
    pub fn new(max_rows: usize) -> Self {
        Self {
            max_rows,
            open: None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.open.is_some()
    }

    /// Admitted rows buffered for the open transaction.
    pub fn buffered(&self) -> usize {
        self.open.as_ref().map_or(0, |t| t.rows.len())
    }

    /// Route one stream record through `filter` and the transaction buffer.
    ///
    /// Returns a batch whenever the stream reaches a transaction boundary:
    /// a commit, a rollback (empty), or a standalone DDL statement.
    pub fn apply(
        &mut self,
        record: StreamRecord,
        filter: &ScopeFilter,
    ) -> Result<Option<TransactionBatch>, CdcError> {
        match record {
            StreamRecord::Begin {
                txn_id, position, ..
            } => {
                self.begin(txn_id, position)?;
                Ok(None)
            }
            StreamRecord::Mutation(mutation) => {
                let standalone = (!self.in_transaction()).then(|| boundary_of(&mutation));
                match filter.admit(mutation) {
                    Some(admitted) => self.push(admitted),
                    None => match standalone {
                        Some(Ok(batch)) => Ok(Some(batch)),
                        Some(Err(e)) => Err(e),
                        None => {
                            self.note_filtered();
                            Ok(None)
                        }
                    },
                }
            }
            StreamRecord::Commit {
                txn_id,
                position,
                timestamp,
            } => self.commit(&txn_id, position, timestamp).map(Some),
            StreamRecord::Rollback { txn_id, position } => {
                self.rollback(&txn_id);
                Ok(Some(TransactionBatch {
                    txn_id,
                    commit_position: position,
                    committed_at: Utc::now(),
                    events: Vec::new(),
                }))
            }
            StreamRecord::Reconnected { position } => {
                if let Some(txn_id) = self.abandon() {
                    warn!(
                        txn_id = %txn_id,
                        resume = %position,
                        "stream reconnected mid-transaction, buffered rows discarded"
                    );
                }
                Ok(None)
            }
            StreamRecord::Heartbeat { .. } | StreamRecord::Rotate { .. } => Ok(None),
        }
    }

    /// Open a transaction. A `Begin` while one is open breaks framing.
    pub fn begin(&mut self, txn_id: String, position: StreamPosition) -> Result<(), CdcError> {
        if let Some(open) = &self.open {
            return Err(CdcError::Protocol(format!(
                "transaction {txn_id} began at {position} while {} (begun at {}) is still open",
                open.txn_id, open.begin_position
            )));
        }
        debug!(txn_id = %txn_id, position = %position, "transaction opened");
        self.open = Some(OpenTransaction {
            txn_id,
            begin_position: position,
            rows: Vec::new(),
            seen: 0,
        });
        Ok(())
    }

    /// Buffer an admitted row, or emit a standalone DDL batch.
    pub fn push(&mut self, admitted: Admitted) -> Result<Option<TransactionBatch>, CdcError> {
        let Some(open) = self.open.as_mut() else {
            let batch = boundary_of(&admitted.mutation)?;
            let mutation_txn = batch.txn_id;
            return Ok(Some(TransactionBatch {
                txn_id: mutation_txn,
                commit_position: batch.commit_position,
                committed_at: batch.committed_at,
                events: vec![admitted.into_event(0)],
            }));
        };
        open.seen += 1;
        if open.rows.len() >= self.max_rows {
            return Err(CdcError::TransactionOverflow {
                txn_id: open.txn_id.clone(),
                limit: self.max_rows,
            });
        }
        open.rows.push(admitted);
        gauge!(m::PIPELINE_TXN_BUFFER_ROWS).set(open.rows.len() as f64);
        Ok(None)
    }

    fn note_filtered(&mut self) {
        if let Some(open) = self.open.as_mut() {
            open.seen += 1;
        }
    }

    /// Close the open transaction and emit its admitted rows in order.
    pub fn commit(
        &mut self,
        txn_id: &str,
        position: StreamPosition,
        timestamp: DateTime<Utc>,
    ) -> Result<TransactionBatch, CdcError> {
        gauge!(m::PIPELINE_TXN_BUFFER_ROWS).set(0.0);
        let Some(open) = self.open.take() else {
            warn!(txn_id = %txn_id, position = %position, "commit without open transaction");
            return Ok(TransactionBatch {
                txn_id: txn_id.to_owned(),
                commit_position: position,
                committed_at: timestamp,
                events: Vec::new(),
            });
        };
        if open.txn_id != txn_id {
            return Err(CdcError::Protocol(format!(
                "commit of {txn_id} at {position} while {} is open",
                open.txn_id
            )));
        }

        let mut events = Vec::with_capacity(open.rows.len());
        for (seq, admitted) in open.rows.into_iter().enumerate() {
            let seq = u32::try_from(seq).map_err(|_| {
                CdcError::Protocol(format!("transaction {txn_id} has too many rows"))
            })?;
            counter!(
                m::PIPELINE_EVENTS_TOTAL,
                m::LABEL_OPERATION => admitted.mutation.operation.as_str()
            )
            .increment(1);
            events.push(admitted.into_event(seq));
        }
        counter!(m::PIPELINE_COMMITS_TOTAL).increment(1);
        debug!(
            txn_id = %txn_id,
            position = %position,
            rows = open.seen,
            admitted = events.len(),
            "transaction committed"
        );
        Ok(TransactionBatch {
            txn_id: open.txn_id,
            commit_position: position,
            committed_at: timestamp,
            events,
        })
    }

    /// Discard the open transaction. Returns the number of rows dropped.
    pub fn rollback(&mut self, txn_id: &str) -> usize {
        gauge!(m::PIPELINE_TXN_BUFFER_ROWS).set(0.0);
        counter!(m::PIPELINE_ROLLBACKS_TOTAL).increment(1);
        match self.open.take() {
            Some(open) => {
                debug!(txn_id = %txn_id, discarded = open.rows.len(), "transaction rolled back");
                open.rows.len()
            }
            None => 0,
        }
    }

    /// Drop the open transaction without emitting it; it will be read again
    /// from its start. Returns its id.
    pub fn abandon(&mut self) -> Option<String> {
        gauge!(m::PIPELINE_TXN_BUFFER_ROWS).set(0.0);
        self.open.take().map(|open| open.txn_id)
    }
}

/// Empty batch marking the boundary after a mutation logged outside a
/// transaction. Only DDL may appear there.
fn boundary_of(mutation: &RawMutation) -> Result<TransactionBatch, CdcError> {
    if mutation.operation != Operation::Ddl {
        return Err(CdcError::Protocol(format!(
            "{} on {} at {} outside a transaction",
            mutation.operation,
            mutation.qualified_table(),
            mutation.position
        )));
    }
    Ok(TransactionBatch {
        txn_id: mutation.txn_id.clone(),
        commit_position: mutation.position.clone(),
        committed_at: mutation.timestamp,
        events: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use binwatch_core::config::{IncludeScope, ScopeConfig};
    use binwatch_core::ddl::DdlKind;
    use binwatch_core::types::DdlInfo;
    use serde_json::json;

    const FILE: &str = "mysql-bin.000001";

    fn pos(offset: u64) -> StreamPosition {
        StreamPosition::new(FILE, offset)
    }

    fn row(table: &str, id: i64, offset: u64) -> StreamRecord {
        StreamRecord::Mutation(RawMutation {
            operation: Operation::Insert,
            database: "shop".to_owned(),
            table: table.to_owned(),
            before: None,
            after: Some([("id".to_owned(), json!(id))].into_iter().collect()),
            position: pos(offset),
            txn_id: "t1".to_owned(),
            timestamp: Utc::now(),
            user: None,
            ddl: None,
        })
    }

    fn begin(txn: &str, offset: u64) -> StreamRecord {
        StreamRecord::Begin {
            txn_id: txn.to_owned(),
            position: pos(offset),
            timestamp: Utc::now(),
        }
    }

    fn commit(txn: &str, offset: u64) -> StreamRecord {
        StreamRecord::Commit {
            txn_id: txn.to_owned(),
            position: pos(offset),
            timestamp: Utc::now(),
        }
    }

    fn orders_only() -> ScopeFilter {
        ScopeFilter::from_config(&ScopeConfig {
            include: vec![IncludeScope {
                database: "shop".to_owned(),
                table: "orders".to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn commit_emits_admitted_rows_in_order() {
        let filter = orders_only();
        let mut n = Normalizer::new(100);
        assert!(n.apply(begin("t1", 100), &filter).unwrap().is_none());
        for (i, table) in ["orders", "users", "orders", "orders"].iter().enumerate() {
            assert!(
                n.apply(row(table, i as i64, 200 + i as u64), &filter)
                    .unwrap()
                    .is_none()
            );
        }
        assert_eq!(n.buffered(), 3);

        let batch = n.apply(commit("t1", 400), &filter).unwrap().unwrap();
        assert_eq!(batch.commit_position, pos(400));
        let ids: Vec<_> = batch.events.iter().map(|e| e.primary_key["id"].clone()).collect();
        assert_eq!(ids, vec![json!(0), json!(2), json!(3)]);
        let seqs: Vec<_> = batch.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(batch.events.iter().all(|e| e.committed));
        assert!(!n.in_transaction());
    }

    #[test]
    fn rollback_emits_no_events() {
        let filter = orders_only();
        let mut n = Normalizer::new(100);
        n.apply(begin("t1", 100), &filter).unwrap();
        n.apply(row("orders", 1, 200), &filter).unwrap();
        let batch = n
            .apply(
                StreamRecord::Rollback {
                    txn_id: "t1".to_owned(),
                    position: pos(300),
                },
                &filter,
            )
            .unwrap()
            .unwrap();
        assert!(batch.is_empty());
        assert!(!n.in_transaction());
    }

    #[test]
    fn overflow_is_fatal() {
        let filter = orders_only();
        let mut n = Normalizer::new(2);
        n.apply(begin("big", 100), &filter).unwrap();
        n.apply(row("orders", 1, 200), &filter).unwrap();
        n.apply(row("orders", 2, 210), &filter).unwrap();
        // filtered rows do not count against the ceiling
        n.apply(row("users", 3, 215), &filter).unwrap();
        let err = n.apply(row("orders", 4, 220), &filter).unwrap_err();
        assert!(matches!(err, CdcError::TransactionOverflow { limit: 2, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn nested_begin_is_protocol_error() {
        let filter = orders_only();
        let mut n = Normalizer::new(10);
        n.apply(begin("t1", 100), &filter).unwrap();
        let err = n.apply(begin("t2", 200), &filter).unwrap_err();
        assert!(matches!(err, CdcError::Protocol(_)));
    }

    #[test]
    fn row_outside_transaction_is_protocol_error() {
        let filter = orders_only();
        let mut n = Normalizer::new(10);
        assert!(n.apply(row("orders", 1, 200), &filter).is_err());
        // even when filtered out
        assert!(n.apply(row("users", 1, 200), &filter).is_err());
    }

    fn ddl(table: &str, offset: u64) -> StreamRecord {
        StreamRecord::Mutation(RawMutation {
            operation: Operation::Ddl,
            database: "shop".to_owned(),
            table: table.to_owned(),
            before: None,
            after: None,
            position: pos(offset),
            txn_id: format!("{FILE}:{}", offset - 50),
            timestamp: Utc::now(),
            user: Some("dba@localhost".to_owned()),
            ddl: Some(DdlInfo {
                statement: format!("ALTER TABLE {table} ADD COLUMN note TEXT"),
                kind: Some(DdlKind::Alter),
                parsed: true,
            }),
        })
    }

    #[test]
    fn standalone_ddl_is_its_own_batch() {
        let filter = orders_only();
        let mut n = Normalizer::new(10);
        let batch = n.apply(ddl("orders", 900), &filter).unwrap().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].operation, Operation::Ddl);
        assert_eq!(batch.commit_position, pos(900));

        // out of scope DDL still marks a boundary
        let batch = n.apply(ddl("users", 1000), &filter).unwrap().unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.commit_position, pos(1000));
    }

    #[test]
    fn reconnect_abandons_open_transaction() {
        let filter = orders_only();
        let mut n = Normalizer::new(10);
        n.apply(begin("t1", 100), &filter).unwrap();
        n.apply(row("orders", 1, 200), &filter).unwrap();
        n.apply(StreamRecord::Reconnected { position: pos(100) }, &filter)
            .unwrap();
        assert!(!n.in_transaction());

        // the transaction is read again from its start
        n.apply(begin("t1", 100), &filter).unwrap();
        n.apply(row("orders", 1, 200), &filter).unwrap();
        let batch = n.apply(commit("t1", 300), &filter).unwrap().unwrap();
        assert_eq!(batch.events.len(), 1);
    }

    #[test]
    fn mismatched_commit_is_protocol_error() {
        let filter = orders_only();
        let mut n = Normalizer::new(10);
        n.apply(begin("t1", 100), &filter).unwrap();
        assert!(n.apply(commit("t2", 300), &filter).is_err());
    }

    #[test]
    fn stray_commit_yields_empty_batch() {
        let filter = orders_only();
        let mut n = Normalizer::new(10);
        let batch = n.apply(commit("t9", 300), &filter).unwrap().unwrap();
        assert!(batch.is_empty());
    }
}
