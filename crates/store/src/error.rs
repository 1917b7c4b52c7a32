//! Store errors.

use binwatch_core::error::{BinwatchError, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Stored data that cannot be mapped back to a domain type.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store opened read-only")]
    ReadOnly,

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl From<StoreError> for BinwatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io { .. } => StorageError::Connection(err.to_string()).into(),
            other => StorageError::Query(other.to_string()).into(),
        }
    }
}
