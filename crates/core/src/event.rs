//! Records passed between pipeline stages.
//!
//! The binlog reader emits [`StreamRecord`]s in log order; the normalizer
//! turns each committed transaction into one [`TransactionBatch`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChangeEvent, Checkpoint, RawMutation, StreamPosition};

// --- module names ---

/// Binlog stream reader module name
pub const MODULE_BINLOG_READER: &str = "binlog-reader";
/// CDC pipeline module name
pub const MODULE_CDC_PIPELINE: &str = "cdc-pipeline";
/// Change store module name
pub const MODULE_CHANGE_STORE: &str = "change-store";
/// Notifier module name
pub const MODULE_NOTIFIER: &str = "notifier";
/// Query API module name
pub const MODULE_QUERY_API: &str = "query-api";

/// One element of the decoded replication stream.
///
/// Transaction boundaries are explicit so the normalizer never has to
/// infer them.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    /// Transaction opened.
    Begin {
        txn_id: String,
        position: StreamPosition,
        timestamp: DateTime<Utc>,
    },
    /// Row mutation or DDL statement.
    Mutation(RawMutation),
    /// Transaction committed; `position` is where the next transaction starts.
    Commit {
        txn_id: String,
        position: StreamPosition,
        timestamp: DateTime<Utc>,
    },
    /// Transaction rolled back.
    Rollback {
        txn_id: String,
        position: StreamPosition,
    },
    /// Source is idle and caught up at `position`.
    Heartbeat { position: StreamPosition },
    /// Source switched to a new log file.
    Rotate { position: StreamPosition },
    /// Stream restarted at `position` after a reconnect. Any transaction
    /// still open is abandoned; it is re-read from its start.
    Reconnected { position: StreamPosition },
}

impl StreamRecord {
    /// Position associated with the record.
    pub fn position(&self) -> &StreamPosition {
        match self {
            Self::Begin { position, .. }
            | Self::Commit { position, .. }
            | Self::Rollback { position, .. }
            | Self::Heartbeat { position }
            | Self::Rotate { position }
            | Self::Reconnected { position } => position,
            Self::Mutation(m) => &m.position,
        }
    }
}

/// All in-scope events of one committed transaction.
///
/// May be empty when every mutation was filtered out; it still carries the
/// checkpoint so progress through out-of-scope traffic is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionBatch {
    pub txn_id: String,
    /// Resume position after this transaction.
    pub commit_position: StreamPosition,
    pub committed_at: DateTime<Utc>,
    /// Events in original order, `seq` 0..n.
    pub events: Vec<ChangeEvent>,
}

impl TransactionBatch {
    /// Checkpoint to persist once this batch is durable.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::at_commit(self.commit_position.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_checkpoint_is_transaction_boundary() {
        let batch = TransactionBatch {
            txn_id: "t1".to_owned(),
            commit_position: StreamPosition::new("mysql-bin.000001", 880),
            committed_at: Utc::now(),
            events: Vec::new(),
        };
        let cp = batch.checkpoint();
        assert!(cp.tx_boundary);
        assert_eq!(cp.position.offset, 880);
        assert!(batch.is_empty());
    }

    #[test]
    fn record_position_accessor() {
        let pos = StreamPosition::new("mysql-bin.000002", 4);
        let rec = StreamRecord::Rotate {
            position: pos.clone(),
        };
        assert_eq!(rec.position(), &pos);
    }
}
