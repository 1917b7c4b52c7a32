//! Test support: a binlog event encoder and a scripted connector.
//!
//! Lets pipeline and daemon tests drive the real decoder and reader without
//! a MySQL server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use binwatch_core::config::StartMode;
use binwatch_core::types::StreamPosition;
use bytes::Bytes;

use crate::decoder::{ColumnType, HEADER_LEN, LOG_EVENT_ARTIFICIAL_F, event_type};
use crate::error::BinlogError;
use crate::source::{BinlogConnection, BinlogConnector};

/// Value for one encoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Str(String),
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

/// Builds binlog events the way a MySQL 8 source writes them.
#[derive(Debug, Clone)]
pub struct EventEncoder {
    file: String,
    next_position: u32,
    timestamp: u32,
    checksum: bool,
    tables: HashMap<u64, Vec<(ColumnType, u16)>>,
}

impl EventEncoder {
    /// Encoder positioned at the start of `file`, with CRC32 checksums.
    pub fn new(file: &str) -> Self {
        Self {
            file: file.to_owned(),
            next_position: 4,
            timestamp: 1_700_000_000,
            checksum: true,
            tables: HashMap::new(),
        }
    }

    pub fn without_checksum(mut self) -> Self {
        self.checksum = false;
        self
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// Position after the last encoded event.
    pub fn position(&self) -> StreamPosition {
        StreamPosition::new(self.file.clone(), u64::from(self.next_position))
    }

    fn frame(&mut self, kind: u8, body: &[u8], flags: u16, artificial: bool) -> Bytes {
        let trailer = if self.checksum && kind != event_type::FORMAT_DESCRIPTION {
            4
        } else {
            0
        };
        let len = (HEADER_LEN + body.len() + trailer) as u32;
        let next = if artificial {
            0
        } else {
            self.next_position += len;
            self.next_position
        };
        let mut out = Vec::with_capacity(len as usize);
        out.extend_from_slice(&(if artificial { 0 } else { self.timestamp }).to_le_bytes());
        out.push(kind);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&next.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(body);
        out.extend(std::iter::repeat_n(0u8, trailer));
        Bytes::from(out)
    }

    fn event(&mut self, kind: u8, body: &[u8]) -> Bytes {
        self.frame(kind, body, 0, false)
    }

    /// The artificial ROTATE a server sends first on every dump.
    pub fn fake_rotate(&mut self, file: &str, position: u64) -> Bytes {
        self.file = file.to_owned();
        self.next_position = position as u32;
        let mut body = position.to_le_bytes().to_vec();
        body.extend_from_slice(file.as_bytes());
        self.frame(event_type::ROTATE, &body, LOG_EVENT_ARTIFICIAL_F, true)
    }

    /// ROTATE at the end of the current file; switches to `next_file`.
    pub fn rotate(&mut self, next_file: &str) -> Bytes {
        let mut body = 4u64.to_le_bytes().to_vec();
        body.extend_from_slice(next_file.as_bytes());
        let event = self.event(event_type::ROTATE, &body);
        self.file = next_file.to_owned();
        self.next_position = 4;
        event
    }

    pub fn format_description(&mut self) -> Bytes {
        let mut body = 4u16.to_le_bytes().to_vec();
        let mut version = b"8.0.36".to_vec();
        version.resize(50, 0);
        body.extend_from_slice(&version);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(HEADER_LEN as u8);
        // post-header lengths, one per event type
        body.extend(std::iter::repeat_n(8u8, 40));
        body.push(u8::from(self.checksum));
        body.extend_from_slice(&[0u8; 4]);
        self.event(event_type::FORMAT_DESCRIPTION, &body)
    }

    pub fn gtid(&mut self, sid: [u8; 16], gno: u64) -> Bytes {
        let mut body = vec![1u8];
        body.extend_from_slice(&sid);
        body.extend_from_slice(&gno.to_le_bytes());
        body.extend_from_slice(&[0u8; 16]);
        self.event(event_type::GTID, &body)
    }

    /// QUERY event with `statement` run in `schema`.
    pub fn query(&mut self, schema: &str, statement: &str) -> Bytes {
        self.query_with_status(schema, statement, &[])
    }

    /// QUERY event carrying a Q_INVOKER status variable.
    pub fn query_as(&mut self, schema: &str, statement: &str, user: &str, host: &str) -> Bytes {
        let mut status = vec![11u8, user.len() as u8];
        status.extend_from_slice(user.as_bytes());
        status.push(host.len() as u8);
        status.extend_from_slice(host.as_bytes());
        self.query_with_status(schema, statement, &status)
    }

    fn query_with_status(&mut self, schema: &str, statement: &str, status: &[u8]) -> Bytes {
        let mut body = 7u32.to_le_bytes().to_vec();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(schema.len() as u8);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(status.len() as u16).to_le_bytes());
        body.extend_from_slice(status);
        body.extend_from_slice(schema.as_bytes());
        body.push(0);
        body.extend_from_slice(statement.as_bytes());
        self.event(event_type::QUERY, &body)
    }

    pub fn begin(&mut self) -> Bytes {
        self.query("", "BEGIN")
    }

    pub fn xid(&mut self, xid: u64) -> Bytes {
        self.event(event_type::XID, &xid.to_le_bytes())
    }

    pub fn heartbeat(&mut self) -> Bytes {
        let file = self.file.clone();
        let next = self.next_position;
        let event = self.frame(event_type::HEARTBEAT, file.as_bytes(), LOG_EVENT_ARTIFICIAL_F, false);
        // heartbeats do not occupy space in the log
        self.next_position = next;
        let mut raw = event.to_vec();
        raw[13..17].copy_from_slice(&next.to_le_bytes());
        Bytes::from(raw)
    }

    /// TABLE_MAP for `columns`; `names` adds COLUMN_NAME optional metadata.
    pub fn table_map(
        &mut self,
        table_id: u64,
        database: &str,
        table: &str,
        columns: &[(ColumnType, u16)],
        names: Option<&[&str]>,
    ) -> Bytes {
        self.tables.insert(table_id, columns.to_vec());
        let mut body = table_id.to_le_bytes()[..6].to_vec();
        body.extend_from_slice(&1u16.to_le_bytes());
        body.push(database.len() as u8);
        body.extend_from_slice(database.as_bytes());
        body.push(0);
        body.push(table.len() as u8);
        body.extend_from_slice(table.as_bytes());
        body.push(0);
        body.push(columns.len() as u8);
        body.extend(columns.iter().map(|(t, _)| t.code()));

        let mut meta = Vec::new();
        for (column_type, m) in columns {
            match column_type {
                ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => {
                    meta.extend_from_slice(&m.to_le_bytes());
                }
                ColumnType::NewDecimal | ColumnType::String => {
                    meta.extend_from_slice(&m.to_be_bytes());
                }
                ColumnType::Blob
                | ColumnType::Json
                | ColumnType::Double
                | ColumnType::Float
                | ColumnType::DateTime2
                | ColumnType::Timestamp2
                | ColumnType::Time2 => meta.push(*m as u8),
                _ => {}
            }
        }
        body.push(meta.len() as u8);
        body.extend_from_slice(&meta);
        // every column nullable
        body.extend(std::iter::repeat_n(0xFFu8, columns.len().div_ceil(8)));

        if let Some(names) = names {
            let mut value = Vec::new();
            for name in names {
                value.push(name.len() as u8);
                value.extend_from_slice(name.as_bytes());
            }
            body.push(4);
            body.push(value.len() as u8);
            body.extend_from_slice(&value);
        }
        self.event(event_type::TABLE_MAP, &body)
    }

    pub fn write_rows(&mut self, table_id: u64, rows: &[Vec<Cell>]) -> Bytes {
        let images: Vec<&[Cell]> = rows.iter().map(Vec::as_slice).collect();
        self.rows(event_type::WRITE_ROWS_V2, table_id, &images, false)
    }

    pub fn delete_rows(&mut self, table_id: u64, rows: &[Vec<Cell>]) -> Bytes {
        let images: Vec<&[Cell]> = rows.iter().map(Vec::as_slice).collect();
        self.rows(event_type::DELETE_ROWS_V2, table_id, &images, false)
    }

    /// UPDATE rows from `(before, after)` pairs.
    pub fn update_rows(&mut self, table_id: u64, rows: &[(Vec<Cell>, Vec<Cell>)]) -> Bytes {
        let images: Vec<&[Cell]> = rows
            .iter()
            .flat_map(|(b, a)| [b.as_slice(), a.as_slice()])
            .collect();
        self.rows(event_type::UPDATE_ROWS_V2, table_id, &images, true)
    }

    fn rows(&mut self, kind: u8, table_id: u64, images: &[&[Cell]], update: bool) -> Bytes {
        let columns = self.tables.get(&table_id).cloned().unwrap_or_default();
        let mut body = table_id.to_le_bytes()[..6].to_vec();
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes()); // empty extra data
        body.push(columns.len() as u8);
        let bitmap_len = columns.len().div_ceil(8);
        let present = vec![0xFFu8; bitmap_len];
        body.extend_from_slice(&present);
        if update {
            body.extend_from_slice(&present);
        }

        for image in images {
            let mut nulls = vec![0u8; bitmap_len];
            for (idx, cell) in image.iter().enumerate() {
                if *cell == Cell::Null {
                    nulls[idx / 8] |= 1 << (idx % 8);
                }
            }
            body.extend_from_slice(&nulls);
            for ((column_type, meta), cell) in columns.iter().zip(image.iter()) {
                encode_cell(&mut body, *column_type, *meta, cell);
            }
        }
        self.event(kind, &body)
    }
}

fn encode_cell(out: &mut Vec<u8>, column_type: ColumnType, meta: u16, cell: &Cell) {
    match cell {
        Cell::Null => {}
        Cell::Int(v) => {
            let width = match column_type {
                ColumnType::Tiny => 1,
                ColumnType::Short => 2,
                ColumnType::Int24 => 3,
                ColumnType::LongLong => 8,
                _ => 4,
            };
            out.extend_from_slice(&v.to_le_bytes()[..width]);
        }
        Cell::Str(s) => match column_type {
            ColumnType::Blob => {
                let width = usize::from(meta).clamp(1, 4);
                out.extend_from_slice(&(s.len() as u32).to_le_bytes()[..width]);
                out.extend_from_slice(s.as_bytes());
            }
            _ => {
                if meta < 256 {
                    out.push(s.len() as u8);
                } else {
                    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
                }
                out.extend_from_slice(s.as_bytes());
            }
        },
    }
}

/// One scripted step of a replication session.
#[derive(Debug)]
pub enum ScriptedEvent {
    Event(Bytes),
    Fail(BinlogError),
    /// Server ends the stream.
    Close,
}

#[derive(Debug, Default)]
struct Script {
    sessions: VecDeque<Vec<ScriptedEvent>>,
    connect_failures: VecDeque<BinlogError>,
    connects: Vec<StreamPosition>,
    no_checksum: bool,
    now: Option<StreamPosition>,
    earliest: Option<StreamPosition>,
    columns: HashMap<(String, String), Vec<String>>,
}

/// In-memory [`BinlogConnector`] replaying scripted sessions, one per
/// successful connect. An exhausted session stays idle.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a session that delivers `events` and then idles.
    pub fn with_session(self, events: Vec<Bytes>) -> Self {
        self.push_session(events.into_iter().map(ScriptedEvent::Event).collect());
        self
    }

    pub fn push_session(&self, steps: Vec<ScriptedEvent>) {
        self.lock().sessions.push_back(steps);
    }

    /// Sessions carry no CRC32 trailers (pair with
    /// [`EventEncoder::without_checksum`]).
    pub fn without_checksum(self) -> Self {
        self.lock().no_checksum = true;
        self
    }

    /// Make the next connect attempt fail with `err`.
    pub fn with_connect_failure(self, err: BinlogError) -> Self {
        self.lock().connect_failures.push_back(err);
        self
    }

    pub fn with_positions(self, now: StreamPosition, earliest: StreamPosition) -> Self {
        {
            let mut script = self.lock();
            script.now = Some(now);
            script.earliest = Some(earliest);
        }
        self
    }

    pub fn with_columns(self, database: &str, table: &str, names: &[&str]) -> Self {
        self.lock().columns.insert(
            (database.to_owned(), table.to_owned()),
            names.iter().map(|n| (*n).to_owned()).collect(),
        );
        self
    }

    /// Start positions of every successful connect, in order.
    pub fn connects(&self) -> Vec<StreamPosition> {
        self.lock().connects.clone()
    }
}

impl BinlogConnector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self, start: &StreamPosition) -> Result<ScriptedConnection, BinlogError> {
        let mut script = self.lock();
        if let Some(err) = script.connect_failures.pop_front() {
            return Err(err);
        }
        let Some(steps) = script.sessions.pop_front() else {
            return Err(BinlogError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no scripted session left",
            )));
        };
        script.connects.push(start.clone());
        Ok(ScriptedConnection {
            steps: steps.into(),
            checksum: !script.no_checksum,
        })
    }

    async fn resolve_start(&self, mode: StartMode) -> Result<StreamPosition, BinlogError> {
        let script = self.lock();
        let position = match mode {
            StartMode::Now => script.now.clone(),
            StartMode::Earliest => script.earliest.clone(),
        };
        position.ok_or_else(|| BinlogError::Protocol("no scripted start position".to_owned()))
    }

    async fn column_names(&self, database: &str, table: &str) -> Result<Vec<String>, BinlogError> {
        self.lock()
            .columns
            .get(&(database.to_owned(), table.to_owned()))
            .cloned()
            .ok_or_else(|| BinlogError::Server {
                code: 1146,
                message: format!("Table '{database}.{table}' doesn't exist"),
            })
    }
}

/// Connection handed out by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedConnection {
    steps: VecDeque<ScriptedEvent>,
    checksum: bool,
}

impl BinlogConnection for ScriptedConnection {
    async fn next_event(&mut self) -> Result<Option<Bytes>, BinlogError> {
        match self.steps.pop_front() {
            Some(ScriptedEvent::Event(raw)) => Ok(Some(raw)),
            Some(ScriptedEvent::Fail(err)) => Err(err),
            Some(ScriptedEvent::Close) => Ok(None),
            None => std::future::pending().await,
        }
    }

    fn checksum(&self) -> bool {
        self.checksum
    }
}
