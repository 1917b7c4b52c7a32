//! Stream reader state machine.
//!
//! `Disconnected → Connecting → Streaming → (Draining) → Stopped`, with
//! `Failed` for fatal errors. Retryable failures drop the connection, back
//! off and reconnect from the last acknowledged checkpoint, never from the
//! last wire position, so a half-read transaction is re-read whole.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use binwatch_core::config::{ReconnectConfig, SourceConfig, StaleCheckpointPolicy, StartMode};
use binwatch_core::error::{BinwatchError, PipelineError};
use binwatch_core::event::StreamRecord;
use binwatch_core::metrics as m;
use binwatch_core::types::{Checkpoint, Operation, StreamPosition};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::decoder::{BinlogDecoder, BinlogEvent, TableMap};
use crate::error::BinlogError;
use crate::source::{BinlogConnection, BinlogConnector};
use crate::translate::Translator;

/// Reader lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderState {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
    Draining,
    Stopped,
    Failed,
}

impl ReaderState {
    /// Numeric form for the state gauge.
    pub fn code(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Streaming => 2,
            Self::Draining => 3,
            Self::Stopped => 4,
            Self::Failed => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Snapshot published on every state change and event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReaderStatus {
    pub state: ReaderState,
    /// Position after the last event read from the wire.
    pub position: Option<StreamPosition>,
    /// Source timestamp of the last non-artificial event.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Seconds between `last_event_at` and the time it was read; 0 while
    /// the source sends heartbeats.
    pub lag_secs: Option<i64>,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

/// Shared handle onto the reader's status channel.
#[derive(Debug, Clone)]
pub struct ReaderStatusHandle {
    tx: Arc<watch::Sender<ReaderStatus>>,
}

impl Default for ReaderStatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderStatusHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReaderStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReaderStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ReaderStatus {
        self.tx.borrow().clone()
    }

    pub fn set_state(&self, state: ReaderState) {
        gauge!(m::READER_STATE).set(f64::from(state.code()));
        self.tx.send_modify(|s| s.state = state);
    }

    /// Mark the reader failed with `reason`.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        gauge!(m::READER_STATE).set(f64::from(ReaderState::Failed.code()));
        self.tx.send_modify(|s| {
            s.state = ReaderState::Failed;
            s.last_error = Some(reason);
        });
    }

    fn update(&self, f: impl FnOnce(&mut ReaderStatus)) {
        self.tx.send_modify(f);
    }
}

/// Reader tuning taken from `[source]`.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub reconnect: ReconnectConfig,
    pub on_stale_checkpoint: StaleCheckpointPolicy,
    pub resolve_column_names: bool,
}

impl From<&SourceConfig> for ReaderOptions {
    fn from(config: &SourceConfig) -> Self {
        Self {
            reconnect: config.reconnect.clone(),
            on_stale_checkpoint: config.on_stale_checkpoint,
            resolve_column_names: config.resolve_column_names,
        }
    }
}

/// Decide where streaming starts.
///
/// A stored checkpoint wins; then an explicit `start_position`; then
/// `start_mode` resolved against the source.
pub async fn resolve_start<C: BinlogConnector>(
    connector: &C,
    checkpoint: Option<&Checkpoint>,
    config: &SourceConfig,
) -> Result<StreamPosition, BinwatchError> {
    if let Some(cp) = checkpoint {
        if !cp.tx_boundary {
            return Err(PipelineError::Fatal(format!(
                "stored checkpoint {cp} is not a transaction boundary"
            ))
            .into());
        }
        info!(position = %cp.position, "resuming from checkpoint");
        return Ok(cp.position.clone());
    }
    if let Some(explicit) = config.explicit_start()? {
        info!(position = %explicit, "starting from configured position");
        return Ok(explicit);
    }
    let position = connector.resolve_start(config.start_mode).await?;
    info!(
        position = %position,
        mode = ?config.start_mode,
        "no checkpoint, starting from resolved position"
    );
    Ok(position)
}

/// Reads the replication stream and yields [`StreamRecord`]s in log order.
///
/// `next_record` must not be cancelled mid-call; run the reader in its own
/// task and hand records over through a channel.
pub struct BinlogReader<C: BinlogConnector> {
    connector: C,
    options: ReaderOptions,
    /// Latest durable checkpoint, fed by the store.
    acked: watch::Receiver<Option<Checkpoint>>,
    start: StreamPosition,
    /// Replaces the checkpoint after a stale-checkpoint restart.
    forced_start: Option<StreamPosition>,
    conn: Option<C::Connection>,
    connected_once: bool,
    decoder: BinlogDecoder,
    translator: Translator,
    pending: VecDeque<StreamRecord>,
    columns: HashMap<(String, String), Vec<String>>,
    status: ReaderStatusHandle,
}

impl<C: BinlogConnector> BinlogReader<C> {
    pub fn new(
        connector: C,
        options: ReaderOptions,
        start: StreamPosition,
        acked: watch::Receiver<Option<Checkpoint>>,
        status: ReaderStatusHandle,
    ) -> Self {
        let translator = Translator::new(&start);
        Self {
            connector,
            options,
            acked,
            start,
            forced_start: None,
            conn: None,
            connected_once: false,
            decoder: BinlogDecoder::new(),
            translator,
            pending: VecDeque::new(),
            columns: HashMap::new(),
            status,
        }
    }

    pub fn status(&self) -> &ReaderStatusHandle {
        &self.status
    }

    /// Where a (re)connect resumes.
    pub fn resume_position(&self) -> StreamPosition {
        let acked = self
            .acked
            .borrow()
            .as_ref()
            .map(|cp| cp.position.clone());
        [Some(self.start.clone()), acked, self.forced_start.clone()]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or_else(|| self.start.clone())
    }

    /// Next record. Reconnects internally on retryable errors and then
    /// yields [`StreamRecord::Reconnected`]. Any returned error is fatal.
    pub async fn next_record(&mut self) -> Result<StreamRecord, BinlogError> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(record);
            }

            if self.conn.is_none() {
                let position = self.connect_with_backoff().await?;
                if self.connected_once {
                    return Ok(StreamRecord::Reconnected { position });
                }
                self.connected_once = true;
                continue;
            }

            match self.read_event().await {
                Ok(()) => {}
                Err(err) if err.is_retryable() => {
                    warn!(
                        error = %err,
                        position = %self.translator.position(),
                        "replication stream lost, reconnecting"
                    );
                    self.disconnect(&err);
                }
                Err(BinlogError::StaleCheckpoint { position, message })
                    if self.options.on_stale_checkpoint
                        == StaleCheckpointPolicy::RestartFromNow =>
                {
                    let now = match self.connector.resolve_start(StartMode::Now).await {
                        Ok(now) => now,
                        Err(err) => return Err(self.fatal(err)),
                    };
                    error!(
                        purged_position = %position,
                        restart_position = %now,
                        reason = %message,
                        "checkpoint purged from source; restarting from the current end of the \
                         log. Changes between these positions are lost"
                    );
                    self.forced_start = Some(now);
                    self.disconnect(&BinlogError::StaleCheckpoint { position, message });
                }
                Err(err) => return Err(self.fatal(err)),
            }
        }
    }

    fn disconnect(&mut self, err: &BinlogError) {
        self.conn = None;
        self.pending.clear();
        counter!(m::READER_RECONNECTS_TOTAL).increment(1);
        self.status.set_state(ReaderState::Disconnected);
        self.status.update(|s| {
            s.reconnects += 1;
            s.last_error = Some(err.to_string());
        });
    }

    fn fatal(&mut self, err: BinlogError) -> BinlogError {
        error!(
            error = %err,
            position = %self.translator.position(),
            "replication halted"
        );
        self.conn = None;
        self.status.fail(err.to_string());
        err
    }

    async fn connect_with_backoff(&mut self) -> Result<StreamPosition, BinlogError> {
        let policy = self.options.reconnect.clone();
        let max_backoff = Duration::from_millis(policy.max_backoff_ms);
        let mut backoff = Duration::from_millis(policy.initial_backoff_ms);
        let mut attempt: u32 = 0;

        loop {
            self.status.set_state(ReaderState::Connecting);
            let start = self.resume_position();
            match self.connector.connect(&start).await {
                Ok(conn) => {
                    self.decoder.reset(conn.checksum());
                    self.conn = Some(conn);
                    self.translator = Translator::new(&start);
                    self.status.set_state(ReaderState::Streaming);
                    self.status.update(|s| s.position = Some(start.clone()));
                    info!(position = %start, attempt, "streaming");
                    return Ok(start);
                }
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if policy.max_retries > 0 && attempt >= policy.max_retries {
                        return Err(self.fatal(err));
                    }
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "connect failed, retrying"
                    );
                    self.status.update(|s| s.last_error = Some(err.to_string()));
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(err) => return Err(self.fatal(err)),
            }
        }
    }

    async fn read_event(&mut self) -> Result<(), BinlogError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let raw = conn.next_event().await?.ok_or(BinlogError::Closed)?;
        let (header, event) = self.decoder.decode(&raw)?;
        counter!(m::READER_EVENTS_TOTAL).increment(1);

        let is_heartbeat = matches!(event, BinlogEvent::Heartbeat);
        if let BinlogEvent::TableMap {
            table_id,
            database,
            table,
            named: false,
        } = &event
        {
            if self.options.resolve_column_names {
                self.resolve_columns(*table_id, database, table).await;
            }
        }

        let records = self.translator.translate(&header, event);
        if records.iter().any(is_ddl) {
            self.columns.clear();
        }

        let position = self.translator.position();
        let now = Utc::now();
        let event_time = (!header.is_artificial() && header.timestamp != 0)
            .then(|| DateTime::from_timestamp(i64::from(header.timestamp), 0))
            .flatten();
        let lag = if is_heartbeat {
            Some(0)
        } else {
            event_time.map(|t| (now - t).num_seconds().max(0))
        };
        if let Some(lag) = lag {
            gauge!(m::READER_LAG_SECONDS).set(lag as f64);
        }
        self.status.update(|s| {
            s.position = Some(position);
            if event_time.is_some() {
                s.last_event_at = event_time;
            }
            if lag.is_some() {
                s.lag_secs = lag;
            }
        });

        self.pending.extend(records);
        Ok(())
    }

    /// Fill in real column names for a table map without metadata. Lookup
    /// failures keep the `@N` placeholders.
    async fn resolve_columns(&mut self, table_id: u64, database: &str, table: &str) {
        let key = (database.to_owned(), table.to_owned());
        if !self.columns.contains_key(&key) {
            match self.connector.column_names(database, table).await {
                Ok(names) => {
                    debug!(database, table, columns = names.len(), "resolved column names");
                    self.columns.insert(key.clone(), names);
                }
                Err(err) => {
                    warn!(database, table, error = %err, "column name lookup failed, using placeholders");
                    return;
                }
            }
        }
        let Some(names) = self.columns.get(&key) else {
            return;
        };
        if !self.decoder.set_column_names(table_id, names) {
            let mapped = self
                .decoder
                .table(table_id)
                .map(|t: &TableMap| t.columns.len())
                .unwrap_or(0);
            warn!(
                database,
                table,
                mapped,
                resolved = names.len(),
                "column count differs from current schema, using placeholders"
            );
        }
    }
}

fn is_ddl(record: &StreamRecord) -> bool {
    matches!(record, StreamRecord::Mutation(m) if m.operation == Operation::Ddl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_are_distinct() {
        let states = [
            ReaderState::Disconnected,
            ReaderState::Connecting,
            ReaderState::Streaming,
            ReaderState::Draining,
            ReaderState::Stopped,
            ReaderState::Failed,
        ];
        for (i, s) in states.iter().enumerate() {
            assert_eq!(usize::from(s.code()), i);
        }
        assert_eq!(ReaderState::Draining.as_str(), "draining");
    }

    #[test]
    fn status_handle_publishes_changes() {
        let handle = ReaderStatusHandle::new();
        let rx = handle.subscribe();
        handle.set_state(ReaderState::Streaming);
        assert_eq!(rx.borrow().state, ReaderState::Streaming);
        handle.fail("decode error");
        let status = handle.current();
        assert_eq!(status.state, ReaderState::Failed);
        assert_eq!(status.last_error.as_deref(), Some("decode error"));
    }

    #[test]
    fn options_follow_source_config() {
        let mut source = SourceConfig::default();
        source.on_stale_checkpoint = StaleCheckpointPolicy::RestartFromNow;
        source.resolve_column_names = false;
        let options = ReaderOptions::from(&source);
        assert_eq!(options.on_stale_checkpoint, StaleCheckpointPolicy::RestartFromNow);
        assert!(!options.resolve_column_names);
    }
}
