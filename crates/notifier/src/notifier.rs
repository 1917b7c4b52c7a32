//! Notifier plugin: consumes alerts from the pipeline and dispatches them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use binwatch_core::config::NotifyConfig;
use binwatch_core::error::{BinwatchError, PipelineError};
use binwatch_core::event::MODULE_NOTIFIER;
use binwatch_core::pipeline::HealthStatus;
use binwatch_core::plugin::{Plugin, PluginInfo, PluginState, PluginType};
use binwatch_core::types::{Alert, DeliveryStatus};
use binwatch_store::ChangeStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::NotificationChannel;
use crate::dispatcher::Dispatcher;
use crate::error::NotifierError;

/// How long `stop` waits for queued alerts before abandoning them.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Delivery counters since start.
#[derive(Debug, Default)]
pub struct NotifierStats {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub suppressed: AtomicU64,
    /// Failed deliveries since the last success.
    pub consecutive_failures: AtomicU64,
}

impl NotifierStats {
    fn observe(&self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Delivered => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            DeliveryStatus::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryStatus::Suppressed => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryStatus::Pending => {}
        }
    }
}

/// Alert delivery plugin.
///
/// Register it after the pipeline so the pipeline stops first; `stop`
/// then delivers whatever is still queued, bounded by the drain timeout.
pub struct Notifier {
    info: PluginInfo,
    state: PluginState,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<NotifierStats>,
    alert_rx: Option<mpsc::Receiver<Alert>>,
    drain: CancellationToken,
    drain_timeout: Duration,
    task: Option<JoinHandle<mpsc::Receiver<Alert>>>,
}

impl Notifier {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> &Arc<NotifierStats> {
        &self.stats
    }
}

impl Plugin for Notifier {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn state(&self) -> PluginState {
        self.state
    }

    async fn init(&mut self) -> Result<(), BinwatchError> {
        if self.alert_rx.is_none() {
            return Err(NotifierError::Channel("alert receiver not configured".to_owned()).into());
        }
        self.state = PluginState::Initialized;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), BinwatchError> {
        if self.state == PluginState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        if self.state == PluginState::Created {
            self.init().await?;
        }

        let rx = self.alert_rx.take().ok_or_else(|| {
            BinwatchError::from(NotifierError::Channel(
                "alert receiver was lost by an earlier aborted drain".to_owned(),
            ))
        })?;

        self.drain = CancellationToken::new();
        let task = DeliveryLoop {
            dispatcher: Arc::clone(&self.dispatcher),
            stats: Arc::clone(&self.stats),
            drain: self.drain.clone(),
        };
        self.task = Some(tokio::spawn(task.run(rx)));
        self.state = PluginState::Running;
        info!(channels = ?self.dispatcher.channel_names(), "notifier started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BinwatchError> {
        if self.state != PluginState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        self.drain.cancel();
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.drain_timeout, &mut task).await {
                Ok(Ok(rx)) => self.alert_rx = Some(rx),
                Ok(Err(e)) => error!(error = %e, "notifier task panicked"),
                Err(_) => {
                    warn!(
                        timeout_secs = self.drain_timeout.as_secs(),
                        "notifier drain timed out, queued alerts stay pending"
                    );
                    task.abort();
                }
            }
        }

        self.state = PluginState::Stopped;
        info!(
            delivered = self.stats.delivered.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            suppressed = self.stats.suppressed.load(Ordering::Relaxed),
            "notifier stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        if self.state != PluginState::Running {
            return HealthStatus::Unhealthy(format!("notifier {}", self.state));
        }
        match self.stats.consecutive_failures.load(Ordering::Relaxed) {
            0 => HealthStatus::Healthy,
            n => HealthStatus::Degraded(format!("{n} consecutive failed deliveries")),
        }
    }
}

struct DeliveryLoop {
    dispatcher: Arc<Dispatcher>,
    stats: Arc<NotifierStats>,
    drain: CancellationToken,
}

impl DeliveryLoop {
    async fn run(self, mut rx: mpsc::Receiver<Alert>) -> mpsc::Receiver<Alert> {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.drain.cancelled() => {
                    let mut drained = 0usize;
                    while let Ok(alert) = rx.try_recv() {
                        self.deliver(&alert).await;
                        drained += 1;
                    }
                    if drained > 0 {
                        info!(drained, "delivered queued alerts during shutdown");
                    }
                    break;
                }
                maybe = rx.recv() => match maybe {
                    Some(alert) => self.deliver(&alert).await,
                    None => {
                        info!("alert channel closed");
                        break;
                    }
                },
                _ = cleanup.tick() => self.dispatcher.cleanup(),
            }
        }
        rx
    }

    async fn deliver(&self, alert: &Alert) {
        let result = self.dispatcher.deliver(alert).await;
        self.stats.observe(result.status);
    }
}

/// Builds a [`Notifier`].
///
/// ```ignore
/// let notifier = NotifierBuilder::new(config.notify.clone())
///     .store(store)
///     .alert_receiver(alert_rx)
///     .build()?;
/// ```
pub struct NotifierBuilder {
    config: NotifyConfig,
    store: Option<Arc<ChangeStore>>,
    alert_rx: Option<mpsc::Receiver<Alert>>,
    extra_channels: Vec<Arc<dyn NotificationChannel>>,
    drain_timeout: Duration,
}

impl NotifierBuilder {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            config,
            store: None,
            alert_rx: None,
            extra_channels: Vec::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Record delivery outcomes in this store.
    pub fn store(mut self, store: Arc<ChangeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn alert_receiver(mut self, rx: mpsc::Receiver<Alert>) -> Self {
        self.alert_rx = Some(rx);
        self
    }

    /// Add a channel that is not described in the configuration.
    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.extra_channels.push(channel);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Notifier, NotifierError> {
        let mut dispatcher = Dispatcher::from_config(&self.config)?;
        for channel in self.extra_channels {
            dispatcher = dispatcher.with_channel(channel);
        }
        if let Some(store) = self.store {
            dispatcher = dispatcher.with_store(store);
        }

        Ok(Notifier {
            info: PluginInfo {
                name: MODULE_NOTIFIER.to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                description: "alert delivery with suppression and retries".to_owned(),
                plugin_type: PluginType::Notifier,
            },
            state: PluginState::Created,
            dispatcher: Arc::new(dispatcher),
            stats: Arc::new(NotifierStats::default()),
            alert_rx: self.alert_rx,
            drain: CancellationToken::new(),
            drain_timeout: self.drain_timeout,
            task: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::sample_alert;
    use crate::dispatcher::tests::ScriptedChannel;
    use crate::error::ChannelError;

    fn builder(rx: mpsc::Receiver<Alert>) -> NotifierBuilder {
        NotifierBuilder::new(NotifyConfig {
            suppression_window_secs: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 10,
            max_attempts: 2,
            ..NotifyConfig::default()
        })
        .alert_receiver(rx)
    }

    #[tokio::test]
    async fn init_requires_receiver() {
        let mut notifier = NotifierBuilder::new(NotifyConfig::default()).build().unwrap();
        assert!(notifier.init().await.is_err());
        assert_eq!(notifier.info().name, MODULE_NOTIFIER);
    }

    #[tokio::test]
    async fn stop_drains_queued_alerts() {
        let (tx, rx) = mpsc::channel(16);
        let ops = ScriptedChannel::new("ops", vec![]);
        let mut notifier = builder(rx).channel(ops.clone()).build().unwrap();

        notifier.start().await.unwrap();
        for i in 0..5 {
            let mut alert = sample_alert();
            alert.id = format!("a-{i}");
            alert.key = format!("k-{i}");
            tx.send(alert).await.unwrap();
        }
        notifier.stop().await.unwrap();

        assert_eq!(ops.calls.load(Ordering::SeqCst), 5);
        assert_eq!(notifier.stats().delivered.load(Ordering::SeqCst), 5);
        assert_eq!(notifier.state(), PluginState::Stopped);
    }

    #[tokio::test]
    async fn restart_after_stop_keeps_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let ops = ScriptedChannel::new("ops", vec![]);
        let mut notifier = builder(rx).channel(ops.clone()).build().unwrap();

        notifier.start().await.unwrap();
        notifier.stop().await.unwrap();
        notifier.start().await.unwrap();
        tx.send(sample_alert()).await.unwrap();
        notifier.stop().await.unwrap();
        assert_eq!(ops.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_degrade_health() {
        let (tx, rx) = mpsc::channel(4);
        let ops = ScriptedChannel::new(
            "ops",
            vec![Err(ChannelError::Permanent("403".to_owned()))],
        );
        let mut notifier = builder(rx).channel(ops).build().unwrap();
        notifier.start().await.unwrap();
        assert!(notifier.health_check().await.is_healthy());

        tx.send(sample_alert()).await.unwrap();
        notifier.stop().await.unwrap();
        assert_eq!(notifier.stats().failed.load(Ordering::SeqCst), 1);

        notifier.start().await.unwrap();
        assert!(matches!(
            notifier.health_check().await,
            HealthStatus::Degraded(_)
        ));
        notifier.stop().await.unwrap();
    }

    #[tokio::test]
    async fn closed_channel_ends_loop() {
        let (tx, rx) = mpsc::channel(4);
        let mut notifier = builder(rx).build().unwrap();
        notifier.start().await.unwrap();
        drop(tx);
        notifier.stop().await.unwrap();
        assert!(notifier.health_check().await.is_unhealthy());
    }

    #[tokio::test]
    async fn stop_when_not_running_fails() {
        let (_tx, rx) = mpsc::channel(1);
        let mut notifier = builder(rx).build().unwrap();
        assert!(notifier.stop().await.is_err());
    }
}
