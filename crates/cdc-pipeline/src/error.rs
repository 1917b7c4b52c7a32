//! CDC pipeline error type.
//!
//! [`CdcError`] covers rule loading, scope evaluation, transaction
//! assembly and stage wiring. `From<CdcError> for BinwatchError` lets the
//! daemon propagate it with `?`; stream-integrity failures map to
//! [`PipelineError::Fatal`].

use binwatch_core::error::{BinwatchError, ConfigError, PipelineError};
use binwatch_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CdcError {
    /// A rule file or directory could not be read or parsed.
    #[error("rule load error: {path}: {reason}")]
    RuleLoad { path: String, reason: String },

    /// A rule is structurally invalid.
    #[error("rule validation error: rule '{rule_id}': {reason}")]
    RuleValidation { rule_id: String, reason: String },

    /// Rule evaluation failed (e.g. a regex missing from the cache).
    #[error("rule match error: {0}")]
    RuleMatch(String),

    #[error("config error: {field}: {reason}")]
    Config { field: String, reason: String },

    /// An open transaction buffered more rows than allowed.
    #[error("transaction {txn_id} exceeds {limit} buffered rows")]
    TransactionOverflow { txn_id: String, limit: usize },

    /// The record stream broke transaction framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A stage channel closed unexpectedly.
    #[error("channel error: {0}")]
    Channel(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdcError {
    /// Errors that must halt ingestion.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TransactionOverflow { .. } | Self::Protocol(_) | Self::Store(_)
        )
    }
}

impl From<ConfigError> for CdcError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidValue { field, reason } => Self::Config { field, reason },
            other => Self::Config {
                field: "config".to_owned(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<CdcError> for BinwatchError {
    fn from(err: CdcError) -> Self {
        match err {
            CdcError::Config { field, reason } => ConfigError::InvalidValue { field, reason }.into(),
            CdcError::RuleLoad { .. } | CdcError::RuleValidation { .. } => {
                ConfigError::InvalidValue {
                    field: "alerts".to_owned(),
                    reason: err.to_string(),
                }
                .into()
            }
            CdcError::Store(e) => e.into(),
            CdcError::TransactionOverflow { .. } | CdcError::Protocol(_) => {
                PipelineError::Fatal(err.to_string()).into()
            }
            CdcError::Channel(reason) => PipelineError::ChannelSend(reason).into(),
            CdcError::RuleMatch(_) | CdcError::Io(_) => {
                PipelineError::InitFailed(err.to_string()).into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_display_names_transaction() {
        let err = CdcError::TransactionOverflow {
            txn_id: "3e11fa47:23".to_owned(),
            limit: 100_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("3e11fa47:23"));
        assert!(msg.contains("100000"));
        assert!(err.is_fatal());
    }

    #[test]
    fn overflow_converts_to_fatal() {
        let err: BinwatchError = CdcError::TransactionOverflow {
            txn_id: "t".to_owned(),
            limit: 1,
        }
        .into();
        assert!(matches!(err, BinwatchError::Pipeline(PipelineError::Fatal(_))));
    }

    #[test]
    fn rule_load_converts_to_config_error() {
        let err: BinwatchError = CdcError::RuleLoad {
            path: "/etc/binwatch/rules/bulk.yml".to_owned(),
            reason: "invalid YAML".to_owned(),
        }
        .into();
        assert!(matches!(err, BinwatchError::Config(_)));
        assert!(err.to_string().contains("bulk.yml"));
    }

    #[test]
    fn channel_error_is_not_fatal() {
        assert!(!CdcError::Channel("receiver closed".to_owned()).is_fatal());
    }
}
