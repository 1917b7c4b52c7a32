//! Notifier error types.

use binwatch_core::error::{BinwatchError, NotifyError, PipelineError};
use binwatch_store::StoreError;

/// Outcome of one failed send attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Worth retrying: timeouts, connection failures, 5xx, 429.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help: rejected credentials, 4xx, bad recipients.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(reason) | Self::Permanent(reason) => reason,
        }
    }
}

/// Notifier errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    /// A channel could not be built from its configuration.
    #[error("channel '{channel}' setup failed: {reason}")]
    Setup { channel: String, reason: String },

    /// Recording a delivery outcome failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The alert receiver is missing or was already taken.
    #[error("channel error: {0}")]
    Channel(String),
}

impl From<NotifierError> for BinwatchError {
    fn from(err: NotifierError) -> Self {
        match err {
            NotifierError::Setup { channel, reason } => {
                NotifyError::Setup { channel, reason }.into()
            }
            NotifierError::Store(e) => e.into(),
            NotifierError::Channel(msg) => PipelineError::ChannelRecv(msg).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ChannelError::Transient("timeout".to_owned()).is_transient());
        assert!(!ChannelError::Permanent("401".to_owned()).is_transient());
        assert_eq!(ChannelError::Permanent("401".to_owned()).reason(), "401");
    }

    #[test]
    fn setup_error_converts_to_notify_error() {
        let err: BinwatchError = NotifierError::Setup {
            channel: "ops".to_owned(),
            reason: "bad url".to_owned(),
        }
        .into();
        assert!(matches!(err, BinwatchError::Notify(NotifyError::Setup { .. })));
        assert!(err.to_string().contains("ops"));
    }
}
