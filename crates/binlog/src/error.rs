//! Replication errors.
//!
//! [`BinlogError`] separates failures the reader retries with backoff
//! (lost connections, timeouts) from failures that halt ingestion
//! (protocol violations, undecodable events, a purged checkpoint).

use binwatch_core::error::{BinwatchError, ParseError, SourceError};
use binwatch_core::types::StreamPosition;

/// MySQL error code for "could not find first log file name in binary log
/// index file" and friends, returned when the requested position is gone.
pub const ER_MASTER_FATAL_ERROR_READING_BINLOG: u16 = 1236;

/// Server error codes that are worth a reconnect.
const RETRYABLE_SERVER_CODES: &[u16] = &[
    1040, // too many connections
    1053, // server shutdown in progress
    1159, // net read interrupted
    1161, // net write interrupted
];

#[derive(Debug, thiserror::Error)]
pub enum BinlogError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection closed by server")]
    Closed,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    /// The checkpoint position has been purged from the source.
    #[error("position {position} is no longer available on the source: {message}")]
    StaleCheckpoint {
        position: StreamPosition,
        message: String,
    },

    #[error("unsupported binlog format: {0}")]
    UnsupportedFormat(String),

    #[error("decode error at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },
}

impl BinlogError {
    pub(crate) fn decode(offset: usize, reason: impl Into<String>) -> Self {
        Self::Decode {
            offset,
            reason: reason.into(),
        }
    }

    /// Whether the reader should reconnect and resume instead of halting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) | Self::Closed => true,
            Self::Server { code, .. } => RETRYABLE_SERVER_CODES.contains(code),
            _ => false,
        }
    }
}

impl From<BinlogError> for BinwatchError {
    fn from(err: BinlogError) -> Self {
        match err {
            BinlogError::Io(_) | BinlogError::Timeout(_) | BinlogError::Closed => {
                SourceError::Connection(err.to_string()).into()
            }
            BinlogError::StaleCheckpoint { position, message } => SourceError::StaleCheckpoint {
                position: position.to_string(),
                reason: message,
            }
            .into(),
            BinlogError::UnsupportedFormat(reason) => SourceError::UnsupportedFormat(reason).into(),
            BinlogError::Decode { offset, reason } => ParseError::Failed { offset, reason }.into(),
            BinlogError::Server { .. } if err.is_retryable() => {
                SourceError::Connection(err.to_string()).into()
            }
            BinlogError::Auth(_) | BinlogError::Protocol(_) | BinlogError::Server { .. } => {
                SourceError::Protocol(err.to_string()).into()
            }
        }
    }
}
