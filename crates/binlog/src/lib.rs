//! # binwatch-binlog
//!
//! MySQL replication client and binary log stream reader.
//!
//! - [`protocol`]: client protocol (handshake, text queries, binlog dump)
//! - [`decoder`]: binlog v4 event decoder with row-image value decoding
//! - [`translate`]: decoded events to ordered [`StreamRecord`]s
//! - [`reader`]: reconnecting reader state machine with backoff and the
//!   stale-checkpoint policy
//! - [`source`]: connector traits and the TCP MySQL connector
//!
//! [`StreamRecord`]: binwatch_core::event::StreamRecord

pub mod cursor;
pub mod decoder;
pub mod error;
pub mod protocol;
pub mod reader;
pub mod source;
#[cfg(feature = "test-util")]
pub mod testing;
pub mod translate;

pub use decoder::{BinlogDecoder, BinlogEvent, EventHeader};
pub use error::BinlogError;
pub use reader::{
    BinlogReader, ReaderOptions, ReaderState, ReaderStatus, ReaderStatusHandle, resolve_start,
};
pub use source::{BinlogConnection, BinlogConnector, MysqlConnector};
