//! Channel trait, channel factory and shared message rendering.

use std::sync::Arc;

use binwatch_core::config::{ChannelConfig, ChannelKind};
use binwatch_core::pipeline::BoxFuture;
use binwatch_core::types::{Alert, RowImage, Severity};

use crate::email::EmailChannel;
use crate::error::{ChannelError, NotifierError};
use crate::log_channel::LogChannel;
use crate::webhook::WebhookChannel;

/// Longest rendering of a row image in a message body.
pub const MAX_IMAGE_CHARS: usize = 500;

/// Alert destination.
///
/// `send` makes exactly one attempt; the dispatcher owns retries.
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Alerts below this severity are not sent here.
    fn min_severity(&self) -> Severity;

    fn send<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), ChannelError>>;
}

/// Build the channel described by `config`.
pub fn build_channel(config: &ChannelConfig) -> Result<Arc<dyn NotificationChannel>, NotifierError> {
    let channel: Arc<dyn NotificationChannel> = match config.kind {
        ChannelKind::Log => Arc::new(LogChannel::new(&config.name, config.min_severity)),
        ChannelKind::Webhook => Arc::new(WebhookChannel::from_config(config)?),
        ChannelKind::Email => Arc::new(EmailChannel::from_config(config)?),
    };
    Ok(channel)
}

/// `[prefix][SEVERITY] rule_id: db.table OPERATION`
pub fn render_subject(prefix: &str, alert: &Alert) -> String {
    let target = alert.table().unwrap_or_else(|| alert.key.clone());
    let mut subject = format!(
        "{prefix}[{}] {}: {target}",
        alert.severity.as_str().to_uppercase(),
        alert.rule_id
    );
    if let Some(op) = alert.operation() {
        subject.push(' ');
        subject.push_str(op.as_str());
    }
    subject
}

/// Plain-text body with the triggering change or window aggregate.
pub fn render_body(alert: &Alert) -> String {
    let mut lines = vec![
        format!("Rule:      {} ({})", alert.rule_id, alert.rule_title),
        format!("Severity:  {}", alert.severity),
        format!("Raised at: {}", alert.created_at.to_rfc3339()),
    ];

    if let Some(event) = &alert.event {
        lines.push(format!("Table:     {}", event.qualified_table()));
        lines.push(format!("Operation: {}", event.operation));
        lines.push(format!("Timestamp: {}", event.timestamp.to_rfc3339()));
        lines.push(format!("Position:  {}", event.position));
        if let Some(user) = &event.user {
            lines.push(format!("User:      {user}"));
        }
        if let Some(ddl) = &event.ddl {
            lines.push(format!("Statement: {}", truncate(&ddl.statement, MAX_IMAGE_CHARS)));
        }
        if let Some(before) = &event.before {
            lines.push(format!("Before:    {}", render_image(before)));
        }
        if let Some(after) = &event.after {
            lines.push(format!("After:     {}", render_image(after)));
        }
    }

    if let Some(window) = &alert.window {
        lines.push(format!("Group:     {}", window.group_key));
        lines.push(format!(
            "Window:    {} changes in {}s ({} .. {})",
            window.count,
            window.window_secs,
            window.first_seen.to_rfc3339(),
            window.last_seen.to_rfc3339()
        ));
    }

    lines.push(String::new());
    lines.push(format!("Reason: {}", alert.summary));
    lines.join("\n")
}

fn render_image(image: &RowImage) -> String {
    let json = serde_json::to_string(image).unwrap_or_default();
    truncate(&json, MAX_IMAGE_CHARS)
}

/// Cut `s` to at most `max` characters, marking the cut.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_owned(),
    }
}
