//! Notification dispatcher: suppression, channel selection, retries and
//! delivery bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use binwatch_core::config::NotifyConfig;
use binwatch_core::metrics as m;
use binwatch_core::types::{Alert, DeliveryStatus};
use binwatch_store::{ChangeStore, DeliveryRecord};
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::{NotificationChannel, build_channel};
use crate::error::NotifierError;
use crate::suppress::{Suppressor, Verdict};

/// Exponential backoff between attempts on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NotifyConfig::default())
    }
}

/// Result of delivering to one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOutcome {
    pub channel: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Result of `Dispatcher::deliver`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub alert_id: String,
    /// `Delivered` only when every eligible channel succeeded.
    pub status: DeliveryStatus,
    pub channels: Vec<ChannelOutcome>,
    /// Why the alert was suppressed or failed.
    pub reason: Option<String>,
}

impl DeliveryResult {
    fn suppressed(alert: &Alert, reason: impl Into<String>) -> Self {
        Self {
            alert_id: alert.id.clone(),
            status: DeliveryStatus::Suppressed,
            channels: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.channels.iter().map(|c| c.attempts).max().unwrap_or(0)
    }

    fn summary_record(&self) -> DeliveryRecord {
        DeliveryRecord::summary(self.status, self.attempts(), self.reason.clone())
    }
}

/// Delivers alerts to their channels.
///
/// Channels of one alert are tried concurrently. A transient failure is
/// retried with backoff until `max_attempts`; a permanent failure stops
/// retries on that channel at once.
pub struct Dispatcher {
    /// When false every alert is recorded as suppressed.
    enabled: bool,
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
    default_channels: Vec<String>,
    policy: RetryPolicy,
    suppressor: Mutex<Suppressor>,
    store: Option<Arc<ChangeStore>>,
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy, suppressor: Suppressor) -> Self {
        Self {
            enabled: true,
            channels: HashMap::new(),
            default_channels: Vec::new(),
            policy,
            suppressor: Mutex::new(suppressor),
            store: None,
        }
    }

    /// Build every enabled channel in `config`.
    pub fn from_config(config: &NotifyConfig) -> Result<Self, NotifierError> {
        let mut dispatcher = Self::new(
            RetryPolicy::from_config(config),
            Suppressor::from_config(config),
        )
        .with_default_channels(config.default_channels.clone());
        dispatcher.enabled = config.enabled;

        for channel in config.channels.iter().filter(|c| c.enabled) {
            dispatcher = dispatcher.with_channel(build_channel(channel)?);
        }
        info!(
            channels = dispatcher.channels.len(),
            max_attempts = dispatcher.policy.max_attempts,
            "notification channels ready"
        );
        Ok(dispatcher)
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.insert(channel.name().to_owned(), channel);
        self
    }

    pub fn with_default_channels(mut self, channels: Vec<String>) -> Self {
        self.default_channels = channels;
        self
    }

    /// Record delivery outcomes in `store`.
    pub fn with_store(mut self, store: Arc<ChangeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn channel_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Drop expired suppression state.
    pub fn cleanup(&self) {
        self.suppressor().cleanup_expired();
    }

    fn suppressor(&self) -> std::sync::MutexGuard<'_, Suppressor> {
        self.suppressor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn deliver(&self, alert: &Alert) -> DeliveryResult {
        if !self.enabled {
            let result = DeliveryResult::suppressed(alert, "notifications disabled");
            self.record(alert, &result).await;
            return result;
        }

        let verdict = self.suppressor().check(&alert.rule_id, &alert.key);
        if verdict != Verdict::Deliver {
            counter!(m::NOTIFY_SUPPRESSED_TOTAL, m::LABEL_REASON => verdict.as_str()).increment(1);
            debug!(alert_id = %alert.id, rule_id = %alert.rule_id, key = %alert.key,
                reason = verdict.as_str(), "alert suppressed");
            let result = DeliveryResult::suppressed(alert, verdict.as_str());
            self.record(alert, &result).await;
            return result;
        }

        let names = if alert.channels.is_empty() {
            &self.default_channels
        } else {
            &alert.channels
        };

        let mut outcomes = Vec::new();
        let mut eligible = Vec::new();
        for name in names {
            match self.channels.get(name) {
                Some(channel) if alert.severity >= channel.min_severity() => {
                    eligible.push(Arc::clone(channel));
                }
                Some(_) => {
                    debug!(alert_id = %alert.id, channel = %name, "below channel minimum severity");
                }
                None => {
                    warn!(alert_id = %alert.id, channel = %name, "alert names unknown channel");
                    counter!(m::NOTIFY_DELIVERIES_TOTAL,
                        m::LABEL_CHANNEL => name.clone(), m::LABEL_RESULT => "failed")
                    .increment(1);
                    outcomes.push(ChannelOutcome {
                        channel: name.clone(),
                        status: DeliveryStatus::Failed,
                        attempts: 0,
                        error: Some("unknown channel".to_owned()),
                    });
                }
            }
        }

        if eligible.is_empty() && outcomes.is_empty() {
            let result = DeliveryResult::suppressed(alert, "no eligible channel");
            self.record(alert, &result).await;
            return result;
        }

        let shared = Arc::new(alert.clone());
        let mut tasks = JoinSet::new();
        for channel in eligible {
            let alert = Arc::clone(&shared);
            let policy = self.policy;
            tasks.spawn(async move { send_with_retry(channel, alert, policy).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(alert_id = %alert.id, error = %e, "delivery task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.channel.cmp(&b.channel));

        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| o.status != DeliveryStatus::Delivered)
            .map(|o| format!("{}: {}", o.channel, o.error.as_deref().unwrap_or("failed")))
            .collect();

        let result = DeliveryResult {
            alert_id: alert.id.clone(),
            status: if failed.is_empty() {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Failed
            },
            reason: (!failed.is_empty()).then(|| failed.join("; ")),
            channels: outcomes,
        };

        if result.status == DeliveryStatus::Failed {
            warn!(alert_id = %alert.id, rule_id = %alert.rule_id,
                reason = result.reason.as_deref().unwrap_or_default(), "alert delivery failed");
        } else {
            info!(alert_id = %alert.id, rule_id = %alert.rule_id,
                channels = result.channels.len(), "alert delivered");
        }
        self.record(alert, &result).await;
        result
    }

    async fn record(&self, alert: &Alert, result: &DeliveryResult) {
        let Some(store) = &self.store else {
            return;
        };

        let mut records: Vec<DeliveryRecord> = result
            .channels
            .iter()
            .map(|o| DeliveryRecord::channel(&o.channel, o.status, o.attempts, o.error.clone()))
            .collect();
        records.push(result.summary_record());

        let store = Arc::clone(store);
        let alert_id = alert.id.clone();
        let written = tokio::task::spawn_blocking(move || {
            records
                .iter()
                .try_for_each(|record| store.record_delivery(&alert_id, record))
        })
        .await;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(alert_id = %alert.id, error = %e, "failed to record delivery"),
            Err(e) => error!(alert_id = %alert.id, error = %e, "delivery record task failed"),
        }
    }
}

async fn send_with_retry(
    channel: Arc<dyn NotificationChannel>,
    alert: Arc<Alert>,
    policy: RetryPolicy,
) -> ChannelOutcome {
    let name = channel.name().to_owned();
    let started = Instant::now();
    let mut attempts = 0;

    let (status, error) = loop {
        attempts += 1;
        match channel.send(&alert).await {
            Ok(()) => break (DeliveryStatus::Delivered, None),
            Err(e) if e.is_transient() && attempts < policy.max_attempts => {
                let delay = policy.backoff(attempts);
                counter!(m::NOTIFY_RETRIES_TOTAL, m::LABEL_CHANNEL => name.clone()).increment(1);
                warn!(channel = %name, alert_id = %alert.id, attempt = attempts,
                    retry_in_ms = delay.as_millis() as u64, error = %e, "delivery attempt failed");
                tokio::time::sleep(delay).await;
            }
            Err(e) => break (DeliveryStatus::Failed, Some(e.reason().to_owned())),
        }
    };

    let result = if status == DeliveryStatus::Delivered {
        "delivered"
    } else {
        "failed"
    };
    counter!(m::NOTIFY_DELIVERIES_TOTAL,
        m::LABEL_CHANNEL => name.clone(), m::LABEL_RESULT => result)
    .increment(1);
    histogram!(m::NOTIFY_DELIVERY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    ChannelOutcome {
        channel: name,
        status,
        attempts,
        error,
    }
}
