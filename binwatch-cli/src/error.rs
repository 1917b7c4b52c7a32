//! CLI errors and exit codes.

use binwatch_core::error::BinwatchError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bad user input or a failed subcommand.
    #[error("{0}")]
    Command(String),

    /// The daemon holds the PID file; the operation needs it stopped.
    #[error("daemon is running (pid {pid}); stop it first")]
    DaemonRunning { pid: u32 },

    /// The change store or checkpoint slot failed.
    #[error("store error: {0}")]
    Store(String),

    /// The replication source could not be reached.
    #[error("source error: {0}")]
    Source(String),

    #[error("rule error: {0}")]
    Rule(String),

    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code.
    ///
    /// | Code | Meaning |
    /// |------|---------|
    /// | 1 | command, rule or output error |
    /// | 2 | configuration error |
    /// | 3 | daemon running |
    /// | 4 | store error |
    /// | 5 | source unreachable |
    /// | 10 | I/O error |
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::DaemonRunning { .. } => 3,
            Self::Store(_) => 4,
            Self::Source(_) => 5,
            Self::Io(_) => 10,
            Self::Command(_) | Self::Rule(_) | Self::JsonSerialize(_) => 1,
        }
    }
}

impl From<BinwatchError> for CliError {
    fn from(err: BinwatchError) -> Self {
        match err {
            BinwatchError::Config(e) => Self::Config(e.to_string()),
            BinwatchError::Storage(e) => Self::Store(e.to_string()),
            BinwatchError::Source(e) => Self::Source(e.to_string()),
            BinwatchError::Io(e) => Self::Io(e),
            other => Self::Command(other.to_string()),
        }
    }
}

impl From<binwatch_store::StoreError> for CliError {
    fn from(err: binwatch_store::StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<binwatch_binlog::BinlogError> for CliError {
    fn from(err: binwatch_binlog::BinlogError) -> Self {
        Self::Source(err.to_string())
    }
}

impl From<binwatch_cdc_pipeline::CdcError> for CliError {
    fn from(err: binwatch_cdc_pipeline::CdcError) -> Self {
        Self::Rule(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binwatch_core::error::{ConfigError, StorageError};

    #[test]
    fn exit_codes() {
        assert_eq!(CliError::Config("x".to_owned()).exit_code(), 2);
        assert_eq!(CliError::DaemonRunning { pid: 1 }.exit_code(), 3);
        assert_eq!(CliError::Store("x".to_owned()).exit_code(), 4);
        assert_eq!(CliError::Source("x".to_owned()).exit_code(), 5);
        assert_eq!(CliError::Command("x".to_owned()).exit_code(), 1);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(CliError::Io(io).exit_code(), 10);
    }

    #[test]
    fn domain_errors_keep_their_category() {
        let config: CliError = BinwatchError::from(ConfigError::InvalidValue {
            field: "source.binlog_format".to_owned(),
            reason: "row only".to_owned(),
        })
        .into();
        assert!(matches!(config, CliError::Config(ref m) if m.contains("binlog_format")));

        let store: CliError =
            BinwatchError::from(StorageError::Query("locked".to_owned())).into();
        assert_eq!(store.exit_code(), 4);
    }

    #[test]
    fn daemon_running_names_the_pid() {
        let msg = CliError::DaemonRunning { pid: 4242 }.to_string();
        assert!(msg.contains("4242"));
    }
}
