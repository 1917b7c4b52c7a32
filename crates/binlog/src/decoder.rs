//! Binary log event decoder.
//!
//! Decodes the events a row-based replication stream needs:
//! FORMAT_DESCRIPTION, ROTATE, QUERY, XID, TABLE_MAP, WRITE/UPDATE/DELETE
//! rows (v1 and v2), GTID and HEARTBEAT. Anything else is reported as
//! [`BinlogEvent::Ignored`].
//!
//! The decoder keeps the table-map cache and the checksum setting of the
//! current log file; both are reset on reconnect.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use binwatch_core::types::{Operation, RowImage};
use chrono::DateTime;
use serde_json::Value;
use tracing::{debug, trace};

use crate::cursor::ByteCursor;
use crate::error::BinlogError;

/// Common event header length (binlog v4).
pub const HEADER_LEN: usize = 19;

/// Set on events the server synthesises for the dump (they have no real
/// position in the log).
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x20;

const CHECKSUM_LEN: usize = 4;

/// Event type codes.
pub mod event_type {
    pub const QUERY: u8 = 2;
    pub const ROTATE: u8 = 4;
    pub const FORMAT_DESCRIPTION: u8 = 15;
    pub const XID: u8 = 16;
    pub const TABLE_MAP: u8 = 19;
    pub const WRITE_ROWS_V1: u8 = 23;
    pub const UPDATE_ROWS_V1: u8 = 24;
    pub const DELETE_ROWS_V1: u8 = 25;
    pub const HEARTBEAT: u8 = 27;
    pub const WRITE_ROWS_V2: u8 = 30;
    pub const UPDATE_ROWS_V2: u8 = 31;
    pub const DELETE_ROWS_V2: u8 = 32;
    pub const GTID: u8 = 33;
    pub const ANONYMOUS_GTID: u8 = 34;
    pub const PARTIAL_UPDATE_ROWS: u8 = 39;
    pub const TRANSACTION_PAYLOAD: u8 = 40;
}

/// Common event header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    /// Seconds since the epoch, source clock.
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_length: u32,
    /// Offset of the next event in the current file; 0 for some
    /// artificial events.
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(cursor: &mut ByteCursor<'_>) -> Result<Self, BinlogError> {
        Ok(Self {
            timestamp: cursor.u32_le()?,
            event_type: cursor.u8()?,
            server_id: cursor.u32_le()?,
            event_length: cursor.u32_le()?,
            next_position: cursor.u32_le()?,
            flags: cursor.u16_le()?,
        })
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & LOG_EVENT_ARTIFICIAL_F != 0 || self.next_position == 0
    }

    /// Offset of this event in the current file.
    pub fn start_position(&self) -> u64 {
        u64::from(self.next_position).saturating_sub(u64::from(self.event_length))
    }
}

/// MySQL column type as written in TABLE_MAP events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    NewDate,
    Varchar,
    Bit,
    Timestamp2,
    DateTime2,
    Time2,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    Unknown(u8),
}

impl ColumnType {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => Self::Decimal,
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::LongLong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::DateTime,
            13 => Self::Year,
            14 => Self::NewDate,
            15 => Self::Varchar,
            16 => Self::Bit,
            17 => Self::Timestamp2,
            18 => Self::DateTime2,
            19 => Self::Time2,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249 => Self::TinyBlob,
            250 => Self::MediumBlob,
            251 => Self::LongBlob,
            252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Decimal => 0,
            Self::Tiny => 1,
            Self::Short => 2,
            Self::Long => 3,
            Self::Float => 4,
            Self::Double => 5,
            Self::Null => 6,
            Self::Timestamp => 7,
            Self::LongLong => 8,
            Self::Int24 => 9,
            Self::Date => 10,
            Self::Time => 11,
            Self::DateTime => 12,
            Self::Year => 13,
            Self::NewDate => 14,
            Self::Varchar => 15,
            Self::Bit => 16,
            Self::Timestamp2 => 17,
            Self::DateTime2 => 18,
            Self::Time2 => 19,
            Self::Json => 245,
            Self::NewDecimal => 246,
            Self::Enum => 247,
            Self::Set => 248,
            Self::TinyBlob => 249,
            Self::MediumBlob => 250,
            Self::LongBlob => 251,
            Self::Blob => 252,
            Self::VarString => 253,
            Self::String => 254,
            Self::Geometry => 255,
            Self::Unknown(code) => *code,
        }
    }

    /// Types covered by the SIGNEDNESS optional metadata bitmap.
    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Tiny
                | Self::Short
                | Self::Int24
                | Self::Long
                | Self::LongLong
                | Self::Float
                | Self::Double
                | Self::NewDecimal
                | Self::Decimal
        )
    }
}

/// One column of a mapped table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    /// Type-specific metadata from the TABLE_MAP event.
    pub meta: u16,
    pub unsigned: bool,
}

/// Table definition announced by a TABLE_MAP event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMap {
    pub table_id: u64,
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    /// Whether the event carried column names (`binlog_row_metadata=FULL`).
    pub named: bool,
}

impl TableMap {
    /// Placeholder name for column `idx` (0-based) when the log has no names.
    pub fn placeholder_name(idx: usize) -> String {
        format!("@{}", idx + 1)
    }
}

/// Decoded QUERY event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub error_code: u16,
    /// Default database of the session.
    pub schema: String,
    pub statement: String,
    /// `user@host` from the Q_INVOKER status variable, when present.
    pub invoker: Option<String>,
}

/// One decoded row of a rows event.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
}

/// Decoded WRITE/UPDATE/DELETE rows event.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub table_id: u64,
    pub operation: Operation,
    pub database: String,
    pub table: String,
    pub rows: Vec<RowChange>,
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    FormatDescription {
        binlog_version: u16,
        server_version: String,
        checksum: bool,
    },
    Rotate {
        next_file: String,
        position: u64,
    },
    Query(QueryEvent),
    Xid(u64),
    TableMap {
        table_id: u64,
        database: String,
        table: String,
        named: bool,
    },
    Rows(RowsEvent),
    Gtid(String),
    AnonymousGtid,
    Heartbeat,
    Ignored(u8),
}

/// Stateful event decoder.
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    tables: HashMap<u64, TableMap>,
    checksum: bool,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget table maps; `checksum` is the source's setting until the
    /// next FORMAT_DESCRIPTION confirms it.
    pub fn reset(&mut self, checksum: bool) {
        self.tables.clear();
        self.checksum = checksum;
    }

    pub fn table(&self, table_id: u64) -> Option<&TableMap> {
        self.tables.get(&table_id)
    }

    /// Replace placeholder names with resolved ones. Ignored when the count
    /// does not match the mapped column count.
    pub fn set_column_names(&mut self, table_id: u64, names: &[String]) -> bool {
        match self.tables.get_mut(&table_id) {
            Some(map) if map.columns.len() == names.len() => {
                for (column, name) in map.columns.iter_mut().zip(names) {
                    column.name.clone_from(name);
                }
                map.named = true;
                true
            }
            _ => false,
        }
    }

    /// Decode one event (header included, as sent after the 0x00 OK byte).
    pub fn decode(&mut self, data: &[u8]) -> Result<(EventHeader, BinlogEvent), BinlogError> {
        let mut cursor = ByteCursor::new(data);
        let header = EventHeader::parse(&mut cursor)?;

        if header.event_type == event_type::FORMAT_DESCRIPTION {
            let event = self.decode_format_description(&data[HEADER_LEN..])?;
            return Ok((header, event));
        }

        let end = if self.checksum {
            data.len()
                .checked_sub(CHECKSUM_LEN)
                .filter(|end| *end >= HEADER_LEN)
                .ok_or_else(|| BinlogError::decode(data.len(), "event shorter than checksum"))?
        } else {
            data.len()
        };
        let body = &data[HEADER_LEN..end];
        trace!(
            event_type = header.event_type,
            len = body.len(),
            next_position = header.next_position,
            "decoding event"
        );

        let event = match header.event_type {
            event_type::ROTATE => decode_rotate(body)?,
            event_type::QUERY => BinlogEvent::Query(decode_query(body)?),
            event_type::XID => BinlogEvent::Xid(ByteCursor::new(body).u64_le()?),
            event_type::TABLE_MAP => {
                let map = decode_table_map(body)?;
                let event = BinlogEvent::TableMap {
                    table_id: map.table_id,
                    database: map.database.clone(),
                    table: map.table.clone(),
                    named: map.named,
                };
                self.tables.insert(map.table_id, map);
                event
            }
            event_type::WRITE_ROWS_V1 | event_type::WRITE_ROWS_V2 => {
                BinlogEvent::Rows(self.decode_rows(body, header.event_type, Operation::Insert)?)
            }
            event_type::UPDATE_ROWS_V1 | event_type::UPDATE_ROWS_V2 => {
                BinlogEvent::Rows(self.decode_rows(body, header.event_type, Operation::Update)?)
            }
            event_type::DELETE_ROWS_V1 | event_type::DELETE_ROWS_V2 => {
                BinlogEvent::Rows(self.decode_rows(body, header.event_type, Operation::Delete)?)
            }
            event_type::GTID => decode_gtid(body)?,
            event_type::ANONYMOUS_GTID => BinlogEvent::AnonymousGtid,
            event_type::HEARTBEAT => BinlogEvent::Heartbeat,
            event_type::PARTIAL_UPDATE_ROWS => {
                return Err(BinlogError::UnsupportedFormat(
                    "partial JSON row images (binlog_row_value_options=PARTIAL_JSON)".to_owned(),
                ));
            }
            event_type::TRANSACTION_PAYLOAD => {
                return Err(BinlogError::UnsupportedFormat(
                    "compressed transactions (binlog_transaction_compression=ON)".to_owned(),
                ));
            }
            other => BinlogEvent::Ignored(other),
        };
        Ok((header, event))
    }

    /// FDE payload:
    /// `binlog_version(2) server_version(50) create_ts(4) header_len(1)
    /// post_header_lengths(n) [checksum_alg(1) crc(4)]`.
    fn decode_format_description(&mut self, body: &[u8]) -> Result<BinlogEvent, BinlogError> {
        let mut cursor = ByteCursor::new(body);
        let binlog_version = cursor.u16_le()?;
        let server_version = cursor
            .str_n(50)?
            .trim_end_matches('\0')
            .to_owned();
        cursor.skip(4)?;
        let header_len = cursor.u8()?;
        if usize::from(header_len) != HEADER_LEN {
            return Err(BinlogError::UnsupportedFormat(format!(
                "event header length {header_len}"
            )));
        }

        let checksum = version_has_checksum(&server_version)
            && body.len() >= 57 + 1 + CHECKSUM_LEN
            && body[body.len() - CHECKSUM_LEN - 1] == 1;
        self.checksum = checksum;
        debug!(binlog_version, server_version = %server_version, checksum, "format description");

        Ok(BinlogEvent::FormatDescription {
            binlog_version,
            server_version,
            checksum,
        })
    }

    fn decode_rows(
        &self,
        body: &[u8],
        event_type: u8,
        operation: Operation,
    ) -> Result<RowsEvent, BinlogError> {
        let mut cursor = ByteCursor::new(body);
        let table_id = cursor.u48_le()?;
        let _flags = cursor.u16_le()?;

        if matches!(
            event_type,
            event_type::WRITE_ROWS_V2 | event_type::UPDATE_ROWS_V2 | event_type::DELETE_ROWS_V2
        ) {
            let extra_len = usize::from(cursor.u16_le()?);
            cursor.skip(extra_len.saturating_sub(2))?;
        }

        let map = self.tables.get(&table_id).ok_or_else(|| {
            BinlogError::decode(0, format!("rows event for unmapped table id {table_id}"))
        })?;

        let column_count = cursor.packed_len()?;
        if column_count != map.columns.len() {
            return Err(BinlogError::decode(
                cursor.position(),
                format!(
                    "rows event has {column_count} columns, table map for {}.{} has {}",
                    map.database,
                    map.table,
                    map.columns.len()
                ),
            ));
        }
        let bitmap_len = column_count.div_ceil(8);
        let present = cursor.bytes(bitmap_len)?;
        let present_after = if operation == Operation::Update {
            cursor.bytes(bitmap_len)?
        } else {
            present
        };

        let mut rows = Vec::new();
        while !cursor.is_empty() {
            let row = match operation {
                Operation::Insert => RowChange {
                    before: None,
                    after: Some(decode_image(&mut cursor, map, present)?),
                },
                Operation::Delete => RowChange {
                    before: Some(decode_image(&mut cursor, map, present)?),
                    after: None,
                },
                Operation::Update => {
                    let before = decode_image(&mut cursor, map, present)?;
                    let after = decode_image(&mut cursor, map, present_after)?;
                    RowChange {
                        before: Some(before),
                        after: Some(after),
                    }
                }
                Operation::Ddl => unreachable_operation()?,
            };
            rows.push(row);
        }

        Ok(RowsEvent {
            table_id,
            operation,
            database: map.database.clone(),
            table: map.table.clone(),
            rows,
        })
    }
}

fn unreachable_operation() -> Result<RowChange, BinlogError> {
    Err(BinlogError::Protocol("DDL is never a rows event".to_owned()))
}

/// Checksums exist from MySQL 5.6.1 (MariaDB 5.3).
fn version_has_checksum(version: &str) -> bool {
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    if version.contains("MariaDB") {
        return major > 5 || (major == 5 && minor >= 3);
    }
    major > 5 || (major == 5 && minor >= 6)
}

fn decode_rotate(body: &[u8]) -> Result<BinlogEvent, BinlogError> {
    let mut cursor = ByteCursor::new(body);
    let position = cursor.u64_le()?;
    let next_file = String::from_utf8_lossy(cursor.rest())
        .trim_end_matches('\0')
        .to_owned();
    if next_file.is_empty() {
        return Err(BinlogError::decode(8, "rotate event without file name"));
    }
    Ok(BinlogEvent::Rotate {
        next_file,
        position,
    })
}

fn decode_gtid(body: &[u8]) -> Result<BinlogEvent, BinlogError> {
    let mut cursor = ByteCursor::new(body);
    let _flags = cursor.u8()?;
    let sid = cursor.bytes(16)?;
    let gno = cursor.u64_le()?;
    let hex: String = sid.iter().map(|b| format!("{b:02x}")).collect();
    Ok(BinlogEvent::Gtid(format!(
        "{}-{}-{}-{}-{}:{gno}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )))
}

/// QUERY post-header `thread_id(4) exec_time(4) schema_len(1) error_code(2)
/// status_vars_len(2)`, then status vars, schema, NUL, statement.
fn decode_query(body: &[u8]) -> Result<QueryEvent, BinlogError> {
    let mut cursor = ByteCursor::new(body);
    let thread_id = cursor.u32_le()?;
    let _exec_time = cursor.u32_le()?;
    let schema_len = usize::from(cursor.u8()?);
    let error_code = cursor.u16_le()?;
    let status_len = usize::from(cursor.u16_le()?);
    let status_vars = cursor.bytes(status_len)?;
    let schema = cursor.str_n(schema_len)?;
    cursor.skip(1)?;
    let statement = String::from_utf8_lossy(cursor.rest()).into_owned();

    Ok(QueryEvent {
        thread_id,
        error_code,
        schema,
        statement,
        invoker: parse_invoker(status_vars),
    })
}

/// Walk the status variables looking for Q_INVOKER (11). Stops at the
/// first unknown code since its length cannot be known.
fn parse_invoker(vars: &[u8]) -> Option<String> {
    let mut cursor = ByteCursor::new(vars);
    while !cursor.is_empty() {
        let code = cursor.u8().ok()?;
        let skipped = match code {
            0 => cursor.skip(4),
            1 => cursor.skip(8),
            2 => cursor
                .u8()
                .and_then(|len| cursor.skip(usize::from(len) + 1)),
            3 => cursor.skip(4),
            4 => cursor.skip(6),
            5 | 6 => cursor.u8().and_then(|len| cursor.skip(usize::from(len))),
            7 | 8 => cursor.skip(2),
            9 => cursor.skip(8),
            10 => cursor.skip(4),
            11 => {
                let user_len = usize::from(cursor.u8().ok()?);
                let user = cursor.str_n(user_len).ok()?;
                let host_len = usize::from(cursor.u8().ok()?);
                let host = cursor.str_n(host_len).ok()?;
                return Some(if host.is_empty() {
                    user
                } else {
                    format!("{user}@{host}")
                });
            }
            12 => {
                let count = cursor.u8().ok()?;
                // 254 = too many databases, no names follow
                if count != 254 {
                    for _ in 0..count {
                        cursor.nul_str().ok()?;
                    }
                }
                Ok(())
            }
            13 => cursor.skip(3),
            16 | 19 | 20 => cursor.skip(1),
            17 => cursor.skip(8),
            18 => cursor.skip(2),
            _ => return None,
        };
        skipped.ok()?;
    }
    None
}

/// TABLE_MAP: `table_id(6) flags(2) db_len(1) db NUL table_len(1) table NUL
/// column_count(packed) types(n) meta_len(packed) meta null_bitmap
/// [optional metadata TLVs]`.
fn decode_table_map(body: &[u8]) -> Result<TableMap, BinlogError> {
    let mut cursor = ByteCursor::new(body);
    let table_id = cursor.u48_le()?;
    let _flags = cursor.u16_le()?;
    let db_len = usize::from(cursor.u8()?);
    let database = cursor.str_n(db_len)?;
    cursor.skip(1)?;
    let table_len = usize::from(cursor.u8()?);
    let table = cursor.str_n(table_len)?;
    cursor.skip(1)?;

    let column_count = cursor.packed_len()?;
    let types: Vec<ColumnType> = cursor
        .bytes(column_count)?
        .iter()
        .map(|b| ColumnType::from_u8(*b))
        .collect();

    let meta_len = cursor.packed_len()?;
    let mut meta_cursor = ByteCursor::new(cursor.bytes(meta_len)?);
    let mut metas = Vec::with_capacity(column_count);
    for column_type in &types {
        metas.push(read_column_meta(&mut meta_cursor, *column_type)?);
    }
    cursor.skip(column_count.div_ceil(8))?;

    let mut names: Option<Vec<String>> = None;
    let mut unsigned_bits: Option<&[u8]> = None;
    while !cursor.is_empty() {
        let kind = cursor.u8()?;
        let len = cursor.packed_len()?;
        let value = cursor.bytes(len)?;
        match kind {
            1 => unsigned_bits = Some(value),
            4 => {
                let mut names_cursor = ByteCursor::new(value);
                let mut list = Vec::with_capacity(column_count);
                while !names_cursor.is_empty() {
                    let n = names_cursor.packed_len()?;
                    list.push(names_cursor.str_n(n)?);
                }
                names = Some(list);
            }
            _ => {}
        }
    }

    let names = names.filter(|n| n.len() == column_count);
    let named = names.is_some();
    let mut numeric_idx = 0usize;
    let columns = types
        .into_iter()
        .zip(metas)
        .enumerate()
        .map(|(idx, (column_type, meta))| {
            let unsigned = if column_type.is_numeric() {
                let bit = unsigned_bits.is_some_and(|bits| {
                    bits.get(numeric_idx / 8)
                        .is_some_and(|byte| byte & (0x80 >> (numeric_idx % 8)) != 0)
                });
                numeric_idx += 1;
                bit
            } else {
                false
            };
            ColumnDef {
                name: names
                    .as_ref()
                    .map(|n| n[idx].clone())
                    .unwrap_or_else(|| TableMap::placeholder_name(idx)),
                column_type,
                meta,
                unsigned,
            }
        })
        .collect();

    Ok(TableMap {
        table_id,
        database,
        table,
        columns,
        named,
    })
}

fn read_column_meta(cursor: &mut ByteCursor<'_>, column_type: ColumnType) -> Result<u16, BinlogError> {
    Ok(match column_type {
        ColumnType::Float
        | ColumnType::Double
        | ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Json
        | ColumnType::Geometry
        | ColumnType::Time2
        | ColumnType::DateTime2
        | ColumnType::Timestamp2 => u16::from(cursor.u8()?),
        ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => cursor.u16_le()?,
        // (real_type or precision) << 8 | (length or scale)
        ColumnType::NewDecimal | ColumnType::String | ColumnType::Enum | ColumnType::Set => {
            cursor.uint_be(2)? as u16
        }
        _ => 0,
    })
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .is_some_and(|byte| byte & (1 << (idx % 8)) != 0)
}

fn decode_image(
    cursor: &mut ByteCursor<'_>,
    map: &TableMap,
    present: &[u8],
) -> Result<RowImage, BinlogError> {
    let present_count = (0..map.columns.len())
        .filter(|idx| is_bit_set(present, *idx))
        .count();
    let nulls = cursor.bytes(present_count.div_ceil(8))?;

    let mut image = RowImage::new();
    let mut null_idx = 0usize;
    for (idx, column) in map.columns.iter().enumerate() {
        if !is_bit_set(present, idx) {
            continue;
        }
        let value = if is_bit_set(nulls, null_idx) {
            Value::Null
        } else {
            decode_value(cursor, column)?
        };
        null_idx += 1;
        image.insert(column.name.clone(), value);
    }
    Ok(image)
}

fn int_value(raw: u64, bytes: usize, unsigned: bool) -> Value {
    if unsigned {
        return Value::from(raw);
    }
    let shift = 64 - bytes * 8;
    Value::from(((raw << shift) as i64) >> shift)
}

fn float_value(v: f64) -> Value {
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

/// Decode one non-NULL column value.
pub(crate) fn decode_value(cursor: &mut ByteCursor<'_>, column: &ColumnDef) -> Result<Value, BinlogError> {
    let meta = column.meta;
    let value = match column.column_type {
        ColumnType::Tiny => int_value(cursor.uint_le(1)?, 1, column.unsigned),
        ColumnType::Short => int_value(cursor.uint_le(2)?, 2, column.unsigned),
        ColumnType::Int24 => int_value(cursor.uint_le(3)?, 3, column.unsigned),
        ColumnType::Long => int_value(cursor.uint_le(4)?, 4, column.unsigned),
        ColumnType::LongLong => int_value(cursor.uint_le(8)?, 8, column.unsigned),
        ColumnType::Float => float_value(f64::from(cursor.f32_le()?)),
        ColumnType::Double => float_value(cursor.f64_le()?),
        ColumnType::Null => Value::Null,
        ColumnType::Year => {
            let y = cursor.u8()?;
            Value::from(if y == 0 { 0 } else { 1900 + u16::from(y) })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let v = cursor.u24_le()?;
            Value::String(format!(
                "{:04}-{:02}-{:02}",
                v >> 9,
                (v >> 5) & 0x0F,
                v & 0x1F
            ))
        }
        ColumnType::Time => {
            let raw = int_value(cursor.uint_le(3)?, 3, false).as_i64().unwrap_or(0);
            let sign = if raw < 0 { "-" } else { "" };
            let v = raw.unsigned_abs();
            Value::String(format!(
                "{sign}{:02}:{:02}:{:02}",
                v / 10_000,
                (v / 100) % 100,
                v % 100
            ))
        }
        ColumnType::Time2 => Value::String(decode_time2(cursor, meta)?),
        ColumnType::DateTime => {
            let v = cursor.u64_le()?;
            Value::String(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                v / 10_000_000_000,
                (v / 100_000_000) % 100,
                (v / 1_000_000) % 100,
                (v / 10_000) % 100,
                (v / 100) % 100,
                v % 100
            ))
        }
        ColumnType::DateTime2 => Value::String(decode_datetime2(cursor, meta)?),
        ColumnType::Timestamp => Value::String(format_epoch(i64::from(cursor.u32_le()?), 0, 0)),
        ColumnType::Timestamp2 => {
            let secs = cursor.uint_be(4)? as i64;
            let micros = read_fraction(cursor, meta)?;
            Value::String(format_epoch(secs, micros, meta))
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                usize::from(cursor.u8()?)
            } else {
                usize::from(cursor.u16_le()?)
            };
            Value::String(cursor.str_n(len)?)
        }
        ColumnType::String => {
            let (real_type, max_len) = string_real_type(meta);
            match ColumnType::from_u8(real_type) {
                ColumnType::Enum => Value::from(cursor.uint_le(max_len.clamp(1, 2))?),
                ColumnType::Set => Value::from(cursor.uint_le(max_len.clamp(1, 8))?),
                _ => {
                    let len = if max_len < 256 {
                        usize::from(cursor.u8()?)
                    } else {
                        usize::from(cursor.u16_le()?)
                    };
                    Value::String(cursor.str_n(len)?)
                }
            }
        }
        ColumnType::Enum => Value::from(cursor.uint_le(usize::from(meta & 0xFF).clamp(1, 2))?),
        ColumnType::Set => Value::from(cursor.uint_le(usize::from(meta & 0xFF).clamp(1, 8))?),
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob => {
            let len = cursor.uint_le(usize::from(meta).clamp(1, 4))? as usize;
            Value::String(cursor.str_n(len)?)
        }
        ColumnType::Json | ColumnType::Geometry => {
            let len = cursor.uint_le(usize::from(meta).clamp(1, 4))? as usize;
            Value::String(BASE64.encode(cursor.bytes(len)?))
        }
        ColumnType::NewDecimal => {
            let precision = usize::from(meta >> 8);
            let scale = usize::from(meta & 0xFF);
            Value::String(decode_decimal(cursor, precision, scale)?)
        }
        ColumnType::Bit => {
            let bits = usize::from(meta >> 8) * 8 + usize::from(meta & 0xFF);
            let len = bits.div_ceil(8).clamp(1, 8);
            Value::from(cursor.uint_be(len)?)
        }
        ColumnType::Decimal | ColumnType::Unknown(_) => {
            return Err(BinlogError::decode(
                cursor.position(),
                format!("unsupported column type {}", column.column_type.code()),
            ));
        }
    };
    Ok(value)
}

/// Long CHAR columns fold length bits into the real-type byte.
fn string_real_type(meta: u16) -> (u8, usize) {
    let byte0 = (meta >> 8) as u8;
    let byte1 = usize::from(meta & 0xFF);
    if byte0 != 0 && byte0 & 0x30 != 0x30 {
        let len = byte1 | (usize::from((byte0 & 0x30) ^ 0x30) << 4);
        (byte0 | 0x30, len)
    } else {
        (byte0, byte1)
    }
}

/// Fractional seconds as microseconds. `fsp` digits are stored in
/// `ceil(fsp / 2)` big-endian bytes.
fn read_fraction(cursor: &mut ByteCursor<'_>, fsp: u16) -> Result<u32, BinlogError> {
    let bytes = usize::from(fsp.min(6)).div_ceil(2);
    if bytes == 0 {
        return Ok(0);
    }
    let raw = cursor.uint_be(bytes)? as u32;
    Ok(raw * 10u32.pow(6 - 2 * bytes as u32))
}

fn fraction_suffix(micros: u32, fsp: u16) -> String {
    let fsp = u32::from(fsp.min(6));
    if fsp == 0 {
        return String::new();
    }
    format!(
        ".{:0width$}",
        micros / 10u32.pow(6 - fsp),
        width = fsp as usize
    )
}

fn format_epoch(secs: i64, micros: u32, fsp: u16) -> String {
    if secs == 0 {
        return "0000-00-00 00:00:00".to_owned();
    }
    match DateTime::from_timestamp(secs, micros * 1000) {
        Some(ts) => format!(
            "{}{}",
            ts.format("%Y-%m-%d %H:%M:%S"),
            fraction_suffix(micros, fsp)
        ),
        None => secs.to_string(),
    }
}

/// DATETIME2: 5 bytes big-endian, offset 0x8000000000; then fraction.
fn decode_datetime2(cursor: &mut ByteCursor<'_>, fsp: u16) -> Result<String, BinlogError> {
    let packed = (cursor.uint_be(5)? as i64 - 0x80_0000_0000).unsigned_abs();
    let micros = read_fraction(cursor, fsp)?;
    let ymd = packed >> 17;
    let ym = ymd >> 5;
    let hms = packed & 0x1FFFF;
    Ok(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}{}",
        ym / 13,
        ym % 13,
        ymd & 0x1F,
        hms >> 12,
        (hms >> 6) & 0x3F,
        hms & 0x3F,
        fraction_suffix(micros, fsp)
    ))
}

/// TIME2: 3-byte integer part offset by 0x800000, fraction folded in for
/// negative values.
fn decode_time2(cursor: &mut ByteCursor<'_>, fsp: u16) -> Result<String, BinlogError> {
    const INT_OFS: i64 = 0x80_0000;
    let packed: i64 = match fsp.min(6) {
        1 | 2 => {
            let mut int_part = cursor.uint_be(3)? as i64 - INT_OFS;
            let mut frac = cursor.u8()? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = cursor.uint_be(3)? as i64 - INT_OFS;
            let mut frac = cursor.uint_be(2)? as i64;
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        5 | 6 => cursor.uint_be(6)? as i64 - 0x8000_0000_0000,
        _ => (cursor.uint_be(3)? as i64 - INT_OFS) << 24,
    };
    let sign = if packed < 0 { "-" } else { "" };
    let abs = packed.unsigned_abs();
    let hms = abs >> 24;
    let micros = (abs & 0xFF_FFFF) as u32;
    Ok(format!(
        "{sign}{:02}:{:02}:{:02}{}",
        (hms >> 12) & 0x3FF,
        (hms >> 6) & 0x3F,
        hms & 0x3F,
        fraction_suffix(micros, fsp)
    ))
}

const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// NEWDECIMAL: groups of 9 digits in 4 bytes, leftovers packed smaller;
/// sign in the top bit, negative values stored inverted.
fn decode_decimal(
    cursor: &mut ByteCursor<'_>,
    precision: usize,
    scale: usize,
) -> Result<String, BinlogError> {
    if scale > precision || precision > 65 {
        return Err(BinlogError::decode(
            cursor.position(),
            format!("invalid decimal({precision},{scale})"),
        ));
    }
    let intg = precision - scale;
    let (intg0, intg0x) = (intg / 9, intg % 9);
    let (frac0, frac0x) = (scale / 9, scale % 9);
    let size = intg0 * 4 + DIG2BYTES[intg0x] + frac0 * 4 + DIG2BYTES[frac0x];
    if size == 0 {
        return Ok("0".to_owned());
    }

    let mut buf = cursor.bytes(size)?.to_vec();
    let positive = buf[0] & 0x80 != 0;
    buf[0] ^= 0x80;
    if !positive {
        for b in &mut buf {
            *b = !*b;
        }
    }

    let mut digits = ByteCursor::new(&buf);
    let mut int_part = String::new();
    if DIG2BYTES[intg0x] > 0 {
        int_part.push_str(&digits.uint_be(DIG2BYTES[intg0x])?.to_string());
    }
    for _ in 0..intg0 {
        int_part.push_str(&format!("{:09}", digits.uint_be(4)?));
    }
    let int_part = int_part.trim_start_matches('0');

    let mut out = String::new();
    if !positive {
        out.push('-');
    }
    out.push_str(if int_part.is_empty() { "0" } else { int_part });
    if scale > 0 {
        out.push('.');
        for _ in 0..frac0 {
            out.push_str(&format!("{:09}", digits.uint_be(4)?));
        }
        if frac0x > 0 {
            let v = digits.uint_be(DIG2BYTES[frac0x])?;
            out.push_str(&format!("{v:0width$}", width = frac0x));
        }
    }
    Ok(out)
}
