//! Error types, one enum per failure domain.
//!
//! Crates with their own error enums convert into [`BinwatchError`] so the
//! daemon and CLI can treat every failure through one type.

/// Top-level binwatch error.
#[derive(Debug, thiserror::Error)]
pub enum BinwatchError {
    /// Configuration problems (always detected at startup).
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline wiring and lifecycle errors.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Replication source errors.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Parse errors for positions and other textual inputs.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Change store errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Notification delivery errors.
    #[error("notify error: {0}")]
    Notify(#[from] NotifyError),

    /// Plugin registry errors.
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BinwatchError {
    /// Whether this error must halt ingestion (protocol/data errors).
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Source(e) => !matches!(e, SourceError::Connection(_)),
            Self::Pipeline(PipelineError::Fatal(_)) => true,
            _ => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist.
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// TOML could not be parsed, or contained unknown keys.
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A value failed validation.
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Channel send failed (receiver dropped).
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// Channel receive failed (sender dropped).
    #[error("channel receive failed: {0}")]
    ChannelRecv(String),

    /// Component could not be initialised.
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// `start()` called twice.
    #[error("pipeline already running")]
    AlreadyRunning,

    /// `stop()` called on a stopped pipeline.
    #[error("pipeline not running")]
    NotRunning,

    /// Unrecoverable stream error; ingestion halts.
    #[error("fatal stream error: {0}")]
    Fatal(String),
}

/// Replication source errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Transient connection failure.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Protocol violation or malformed record.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The resume position is no longer retained by the source.
    #[error("stale checkpoint {position}: {reason}")]
    StaleCheckpoint { position: String, reason: String },

    /// The source is not configured for row-based logging.
    #[error("unsupported binlog format: {0}")]
    UnsupportedFormat(String),
}

/// Parse errors.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// A stream position string was not `file:offset`.
    #[error("invalid stream position '{input}': expected <file>:<offset>")]
    InvalidPosition { input: String },

    /// A timestamp was neither RFC 3339 nor `YYYY-MM-DD[ HH:MM:SS]`.
    #[error("invalid timestamp '{input}': expected RFC 3339 or YYYY-MM-DD[ HH:MM:SS]")]
    InvalidTimestamp { input: String },

    /// Generic parse failure at a byte offset.
    #[error("parse failed at offset {offset}: {reason}")]
    Failed { offset: usize, reason: String },

    /// Input exceeded a size limit.
    #[error("input too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Store could not be opened.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Statement failed.
    #[error("query failed: {0}")]
    Query(String),
}

/// Notification errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Channel could not be constructed.
    #[error("channel '{channel}' setup failed: {reason}")]
    Setup { channel: String, reason: String },

    /// Delivery failed after all retries.
    #[error("delivery via '{channel}' failed: {reason}")]
    Delivery { channel: String, reason: String },
}

/// Plugin registry errors.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// A plugin with the same name already exists.
    #[error("plugin already registered: {name}")]
    AlreadyRegistered { name: String },

    /// One or more plugins failed to stop.
    #[error("plugin stop failed: {0}")]
    StopFailed(String),
}
