//! Channel that writes alerts to the log.

use binwatch_core::pipeline::BoxFuture;
use binwatch_core::types::{Alert, Severity};
use tracing::warn;

use crate::channel::NotificationChannel;
use crate::error::ChannelError;

/// Emits each alert as a structured `warn` event. Never fails.
#[derive(Debug, Clone)]
pub struct LogChannel {
    name: String,
    min_severity: Severity,
}

impl LogChannel {
    pub fn new(name: impl Into<String>, min_severity: Severity) -> Self {
        Self {
            name: name.into(),
            min_severity,
        }
    }
}

impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    fn send<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move {
            warn!(
                channel = %self.name,
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                severity = %alert.severity,
                key = %alert.key,
                table = alert.table().as_deref().unwrap_or("-"),
                summary = %alert.summary,
                "alert"
            );
            Ok(())
        })
    }
}
