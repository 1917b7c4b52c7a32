//! Component assembly and lifecycle.
//!
//! The [`Orchestrator`] opens the shared change store, wires the pipeline's
//! alert queue into the notifier and registers the plugins in dependency
//! order:
//!
//! 1. CDC pipeline (produces stored changes and alerts)
//! 2. Notifier (consumes alerts)
//! 3. Query API (reads the store)
//!
//! Plugins stop in the same order, so the pipeline drains into the alert
//! queue before the notifier drains it, and the API answers queries until
//! ingestion is fully stopped.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use binwatch_binlog::{BinlogConnector, MysqlConnector};
use binwatch_cdc_pipeline::CdcPipelineBuilder;
use binwatch_core::config::BinwatchConfig;
use binwatch_core::metrics as m;
use binwatch_core::plugin::PluginRegistry;
use binwatch_notifier::NotifierBuilder;
use binwatch_store::ChangeStore;

use crate::api::{ApiState, QueryApi};
use crate::health::{DaemonHealth, IngestionMonitor, ModuleHealth, aggregate_status};
use crate::metrics_server;
use crate::pid::PidFile;

const UPTIME_INTERVAL: Duration = Duration::from_secs(10);

/// Why [`Orchestrator::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Graceful shutdown on a signal.
    Signal(&'static str),
    /// Ingestion halted and `general.exit_on_fatal` is set.
    Fatal(String),
}

impl ExitReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Owns every plugin and drives startup, the main loop and shutdown.
pub struct Orchestrator {
    config: BinwatchConfig,
    plugins: PluginRegistry,
    store: Arc<ChangeStore>,
    monitor: IngestionMonitor,
    fatal: watch::Receiver<Option<String>>,
    start_time: Instant,
}

impl Orchestrator {
    /// Load `path` and build against the configured MySQL source.
    pub async fn build(path: &Path) -> Result<Self> {
        let config = BinwatchConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?;
        Self::build_from_config(config)
    }

    pub fn build_from_config(config: BinwatchConfig) -> Result<Self> {
        let connector = MysqlConnector::new(config.source.clone());
        Self::build_with_connector(config, connector)
    }

    /// Build with an arbitrary replication source.
    pub fn build_with_connector<C>(config: BinwatchConfig, connector: C) -> Result<Self>
    where
        C: BinlogConnector + Clone,
    {
        config.validate().context("config validation failed")?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let store = Arc::new(ChangeStore::open(&config.store).context("opening change store")?);
        info!(path = %store.path().display(), "change store opened");

        let (pipeline, alert_rx) = CdcPipelineBuilder::new(config.clone(), connector)
            .store(Arc::clone(&store))
            .alert_channel_capacity(config.pipeline.queue_depth)
            .build()
            .context("building CDC pipeline")?;

        let monitor = IngestionMonitor::new(
            pipeline.status_handle().clone(),
            pipeline.checkpoints(),
            pipeline.fatal(),
            config.pipeline.lag_degraded_secs,
        );
        let fatal = pipeline.fatal();

        let mut plugins = PluginRegistry::new();
        plugins.register(Box::new(pipeline))?;

        if let Some(alert_rx) = alert_rx {
            let notifier = NotifierBuilder::new(config.notify.clone())
                .store(Arc::clone(&store))
                .alert_receiver(alert_rx)
                .build()
                .context("building notifier")?;
            plugins.register(Box::new(notifier))?;
        } else {
            debug!("alerting disabled, notifier not registered");
        }

        if config.api.enabled {
            let state = ApiState::new(Arc::clone(&store), monitor.clone(), &config.api);
            plugins.register(Box::new(QueryApi::new(&config.api, state)?))?;
        }

        info!(plugins = plugins.count(), "orchestrator assembled");
        if config.metrics.enabled {
            record_daemon_metrics(plugins.count());
        }

        Ok(Self {
            config,
            plugins,
            store,
            monitor,
            fatal,
            start_time: Instant::now(),
        })
    }

    /// Run until SIGTERM/SIGINT, or a fatal ingestion error when
    /// `general.exit_on_fatal` is set.
    pub async fn run(&mut self) -> Result<ExitReason> {
        self.run_until(wait_for_shutdown_signal()).await
    }

    /// Run until `shutdown` resolves or ingestion halts.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<ExitReason>
    where
        F: Future<Output = Result<&'static str>>,
    {
        let pid_file = match self.config.general.pid_file.as_str() {
            "" => None,
            path => Some(PidFile::create(path)?),
        };

        let result = self.serve(shutdown).await;
        if let Some(pid_file) = pid_file {
            pid_file.remove();
        }
        result
    }

    async fn serve<F>(&mut self, shutdown: F) -> Result<ExitReason>
    where
        F: Future<Output = Result<&'static str>>,
    {
        if let Err(e) = self.plugins.init_all().await {
            error!(error = %e, "plugin initialization failed");
            return Err(e.into());
        }
        if let Err(e) = self.plugins.start_all().await {
            warn!("startup failed, stopping already-started plugins");
            if let Err(stop_err) = self.plugins.stop_all().await {
                error!(startup_error = %e, rollback_error = %stop_err, "rollback failed");
            }
            return Err(e.into());
        }

        let background = CancellationToken::new();
        let uptime = self
            .config
            .metrics
            .enabled
            .then(|| spawn_uptime_updater(self.start_time, background.clone()));

        info!("binwatch running");
        let outcome = self.wait(shutdown).await;

        background.cancel();
        if let Some(task) = uptime {
            let _ = task.await;
        }

        let stopped = self.shutdown().await;
        let reason = outcome?;
        stopped?;
        info!(reason = ?reason, "binwatch stopped");
        Ok(reason)
    }

    async fn wait<F>(&self, shutdown: F) -> Result<ExitReason>
    where
        F: Future<Output = Result<&'static str>>,
    {
        let exit_on_fatal = self.config.general.exit_on_fatal;
        let mut fatal = self.fatal.clone();
        let mut watching = true;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    let signal = signal?;
                    info!(signal, "shutdown signal received");
                    return Ok(ExitReason::Signal(signal));
                }
                changed = fatal.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let Some(reason) = fatal.borrow_and_update().clone() else {
                        continue;
                    };
                    if exit_on_fatal {
                        error!(reason = %reason, "fatal ingestion error, shutting down");
                        return Ok(ExitReason::Fatal(reason));
                    }
                    error!(reason = %reason, "fatal ingestion error, ingestion halted; query API keeps serving");
                    watching = false;
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!("stopping all plugins");
        self.plugins.stop_all().await.map_err(Into::into)
    }

    /// Aggregated health of every plugin plus ingestion.
    pub async fn health(&self) -> DaemonHealth {
        let mut modules: Vec<ModuleHealth> = self
            .plugins
            .health()
            .await
            .into_iter()
            .map(|p| ModuleHealth {
                name: p.name,
                status: p.status,
            })
            .collect();
        modules.push(ModuleHealth {
            name: "ingestion".to_owned(),
            status: self.monitor.health(),
        });

        DaemonHealth {
            status: aggregate_status(&modules),
            uptime_secs: self.start_time.elapsed().as_secs(),
            modules,
        }
    }

    pub fn monitor(&self) -> &IngestionMonitor {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<ChangeStore> {
        &self.store
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.names()
    }

    pub fn config(&self) -> &BinwatchConfig {
        &self.config
    }
}

/// Wait for SIGTERM or SIGINT and return its name.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

fn record_daemon_metrics(plugin_count: usize) {
    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!(m::DAEMON_PLUGINS_REGISTERED).set(plugin_count as f64);
}

fn spawn_uptime_updater(start_time: Instant, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS)
                        .set(start_time.elapsed().as_secs() as f64);
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}
