//! Pipeline wiring: reader, normalizer, store and rule tasks.
//!
//! [`CdcPipeline`] implements the core [`Plugin`] trait so the daemon
//! manages it with the same lifecycle as the notifier and the query API.
//!
//! ```text
//! BinlogReader -> mpsc -> ScopeFilter + Normalizer -> mpsc -> ChangeStore
//!                                                               |  checkpoint ack
//!                                                               v
//!                                                     RuleEngine -> mpsc<Alert> -> downstream
//! ```
//!
//! Every queue is bounded, so a slow store stalls the reader instead of
//! buffering without limit. A checkpoint is published only after the batch
//! it covers is durable.

use std::sync::Arc;
use std::time::Duration;

use binwatch_binlog::{
    BinlogConnector, BinlogReader, ReaderOptions, ReaderState, ReaderStatus, ReaderStatusHandle,
    resolve_start,
};
use binwatch_core::config::{BinwatchConfig, PositionStoreKind};
use binwatch_core::error::{BinwatchError, PipelineError};
use binwatch_core::event::{MODULE_CDC_PIPELINE, StreamRecord, TransactionBatch};
use binwatch_core::metrics as m;
use binwatch_core::pipeline::HealthStatus;
use binwatch_core::plugin::{Plugin, PluginInfo, PluginState, PluginType};
use binwatch_core::types::{Alert, ChangeEvent, Checkpoint};
use binwatch_store::{ChangeStore, FilePositionStore, PositionStore, StoreError};
use chrono::{DateTime, TimeDelta, Utc};
use metrics::{gauge, histogram};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CdcError;
use crate::normalizer::Normalizer;
use crate::rule::RuleEngine;
use crate::scope::ScopeFilter;

/// Where checkpoints go.
#[derive(Debug, Clone)]
enum CheckpointSlot {
    /// Same SQLite transaction as the batch.
    Store,
    /// JSON file written after the batch commits.
    File(Arc<FilePositionStore>),
}

/// Publishes the first fatal error and marks the reader failed.
#[derive(Debug, Clone)]
struct FatalSignal {
    tx: Arc<watch::Sender<Option<String>>>,
    status: ReaderStatusHandle,
}

impl FatalSignal {
    fn raise(&self, reason: String) {
        error!(reason = %reason, "ingestion halted");
        self.status.fail(reason.clone());
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    fn is_raised(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Change-data-capture pipeline.
///
/// ```ignore
/// use binwatch_cdc_pipeline::CdcPipelineBuilder;
///
/// let (mut pipeline, alert_rx) = CdcPipelineBuilder::new(config, connector).build()?;
/// pipeline.init().await?;
/// pipeline.start().await?;
/// ```
pub struct CdcPipeline<C: BinlogConnector + Clone> {
    info: PluginInfo,
    config: BinwatchConfig,
    state: PluginState,
    connector: C,
    store: Arc<ChangeStore>,
    slot: CheckpointSlot,
    filter: Arc<ScopeFilter>,
    /// Moved into the rule task while running.
    engine: Option<RuleEngine>,
    status: ReaderStatusHandle,
    acked: Arc<watch::Sender<Option<Checkpoint>>>,
    fatal: FatalSignal,
    alert_tx: Option<mpsc::Sender<Alert>>,
    drain: CancellationToken,
    reader_stop: CancellationToken,
    reader_task: Option<JoinHandle<()>>,
    normalize_task: Option<JoinHandle<()>>,
    store_task: Option<JoinHandle<()>>,
    rule_task: Option<JoinHandle<RuleEngine>>,
}

impl<C: BinlogConnector + Clone> CdcPipeline<C> {
    /// Reader status snapshot.
    pub fn status(&self) -> ReaderStatus {
        self.status.current()
    }

    pub fn status_handle(&self) -> &ReaderStatusHandle {
        &self.status
    }

    /// Latest durable checkpoint, updated after every stored batch.
    pub fn checkpoints(&self) -> watch::Receiver<Option<Checkpoint>> {
        self.acked.subscribe()
    }

    /// First fatal error, if any. The daemon watches this to exit.
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.tx.subscribe()
    }

    pub fn store(&self) -> &Arc<ChangeStore> {
        &self.store
    }

    /// Loaded rules; 0 while running since the engine lives in its task.
    pub fn rule_count(&self) -> usize {
        self.engine.as_ref().map_or(0, RuleEngine::rule_count)
    }

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        match &self.slot {
            CheckpointSlot::Store => self.store.load(),
            CheckpointSlot::File(file) => file.load(),
        }
    }

    async fn load_rules(&mut self) -> Result<(), CdcError> {
        let alerts = &self.config.alerts;
        let mut engine = RuleEngine::new()
            .with_max_window_keys(alerts.max_window_keys)
            .with_default_channels(self.config.notify.default_channels.clone());

        for rule in &alerts.rules {
            engine.add_rule(rule.clone())?;
        }

        if !alerts.rule_dir.is_empty() {
            let dir_rules = crate::rule::RuleLoader::load_directory(&alerts.rule_dir).await?;
            for rule in dir_rules {
                if engine.rules().any(|r| r.id == rule.id) {
                    warn!(
                        rule_id = %rule.id,
                        dir = %alerts.rule_dir,
                        "rule id already defined inline, skipping file rule"
                    );
                    continue;
                }
                self.config
                    .check_rule_channels(&rule, &self.channel_names())
                    .map_err(|e| CdcError::RuleValidation {
                        rule_id: rule.id.clone(),
                        reason: e.to_string(),
                    })?;
                engine.add_rule(rule)?;
            }
        }

        info!(rules = engine.rule_count(), "alert rules loaded");
        self.engine = Some(engine);
        Ok(())
    }

    fn channel_names(&self) -> std::collections::HashSet<&str> {
        self.config
            .notify
            .channels
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Rebuild window state from recently stored events and alerts.
    fn warm_up(engine: &mut RuleEngine, store: &ChangeStore) -> Result<(), StoreError> {
        let now = Utc::now();
        let window = engine.max_window_secs();
        let mut replayed = 0usize;
        if window > 0 {
            for event in store.recent_events(lookback(now, window))? {
                if let Err(e) = engine.replay(&event) {
                    warn!(error = %e, position = %event.position, "replay failed");
                }
                replayed += 1;
            }
        }

        let cooldown = engine.max_cooldown_secs();
        let mut seeded = 0usize;
        if cooldown > 0 {
            for alert in store.recent_alerts(lookback(now, cooldown))? {
                engine.seed_cooldown(&alert);
                seeded += 1;
            }
        }

        info!(
            replayed,
            seeded,
            windows = engine.window_count(),
            "rule window state rebuilt"
        );
        Ok(())
    }
}

fn lookback(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl<C: BinlogConnector + Clone> Plugin for CdcPipeline<C> {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn state(&self) -> PluginState {
        self.state
    }

    async fn init(&mut self) -> Result<(), BinwatchError> {
        if self.config.alerts.enabled {
            self.load_rules().await.map_err(BinwatchError::from)?;
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

        info!("starting cdc pipeline");

        let checkpoint = self.load_checkpoint().map_err(BinwatchError::from)?;
        let start = match resolve_start(&self.connector, checkpoint.as_ref(), &self.config.source)
            .await
        {
            Ok(position) => position,
            Err(e) => {
                self.status.fail(e.to_string());
                self.state = PluginState::Failed;
                return Err(e);
            }
        };
        self.acked.send_replace(checkpoint);
        self.fatal.tx.send_replace(None);
        self.status.set_state(ReaderState::Connecting);

        let pipeline = &self.config.pipeline;
        let depth = pipeline.queue_depth.max(1);

        // rules first: replay must finish before live events arrive
        let (event_tx, rule_task) = match self.engine.take() {
            Some(mut engine) => {
                if self.config.alerts.rebuild_on_start {
                    if let Err(e) = Self::warm_up(&mut engine, &self.store) {
                        warn!(error = %e, "rule warm-up failed, starting with empty windows");
                    }
                }
                let (tx, rx) = mpsc::channel(depth);
                let task = tokio::spawn(run_rules(
                    engine,
                    Arc::clone(&self.store),
                    rx,
                    self.alert_tx.clone(),
                ));
                (Some(tx), Some(task))
            }
            None => (None, None),
        };

        let (record_tx, record_rx) = mpsc::channel(depth);
        let (batch_tx, batch_rx) = mpsc::channel(depth);
        self.drain = CancellationToken::new();
        self.reader_stop = CancellationToken::new();

        let reader = BinlogReader::new(
            self.connector.clone(),
            ReaderOptions::from(&self.config.source),
            start.clone(),
            self.acked.subscribe(),
            self.status.clone(),
        );

        self.store_task = Some(tokio::spawn(run_store(
            Arc::clone(&self.store),
            self.slot.clone(),
            batch_rx,
            event_tx,
            Arc::clone(&self.acked),
            self.fatal.clone(),
        )));

        let normalize = NormalizeTask {
            filter: Arc::clone(&self.filter),
            normalizer: Normalizer::new(pipeline.max_transaction_rows),
            records: record_rx,
            batches: batch_tx,
            cancel: self.drain.clone(),
            status: self.status.clone(),
            fatal: self.fatal.clone(),
            drain_grace: Duration::from_secs(pipeline.drain_grace_secs),
            checkpoint_interval: Duration::from_millis(pipeline.checkpoint_interval_ms),
        };
        self.normalize_task = Some(tokio::spawn(normalize.run()));

        self.reader_task = Some(tokio::spawn(run_reader(
            reader,
            record_tx,
            self.reader_stop.clone(),
            self.fatal.clone(),
        )));
        self.rule_task = rule_task;

        self.state = PluginState::Running;
        info!(start = %start, "cdc pipeline started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BinwatchError> {
        if self.state != PluginState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping cdc pipeline");

        // the normalizer decides when the open transaction is finished;
        // the reader keeps feeding it until then
        self.drain.cancel();
        if let Some(task) = self.normalize_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "normalizer task panicked");
            }
        }

        self.reader_stop.cancel();
        if let Some(task) = self.reader_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "reader task panicked");
            }
        }

        if let Some(task) = self.store_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "store task panicked");
            }
        }

        if let Some(task) = self.rule_task.take() {
            match task.await {
                Ok(engine) => self.engine = Some(engine),
                Err(e) => error!(error = %e, "rule task panicked"),
            }
        }

        if self.status.current().state != ReaderState::Failed {
            self.status.set_state(ReaderState::Stopped);
        }
        self.state = PluginState::Stopped;

        let checkpoint = self.acked.borrow().clone();
        info!(
            checkpoint = ?checkpoint.map(|cp| cp.position.to_string()),
            "cdc pipeline stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        if self.state != PluginState::Running {
            return HealthStatus::Unhealthy(format!("pipeline {}", self.state));
        }
        if let Some(reason) = self.fatal.tx.borrow().as_ref() {
            return HealthStatus::Unhealthy(reason.clone());
        }
        let status = self.status.current();
        match status.state {
            ReaderState::Failed => HealthStatus::Unhealthy(
                status
                    .last_error
                    .unwrap_or_else(|| "reader failed".to_owned()),
            ),
            ReaderState::Connecting | ReaderState::Disconnected => {
                HealthStatus::Degraded("reconnecting to source".to_owned())
            }
            _ => match status.lag_secs {
                Some(lag)
                    if lag > i64::try_from(self.config.pipeline.lag_degraded_secs)
                        .unwrap_or(i64::MAX) =>
                {
                    HealthStatus::Degraded(format!("replication lag {lag}s"))
                }
                _ => HealthStatus::Healthy,
            },
        }
    }
}

async fn run_reader<C: BinlogConnector>(
    mut reader: BinlogReader<C>,
    records: mpsc::Sender<StreamRecord>,
    stop: CancellationToken,
    fatal: FatalSignal,
) {
    loop {
        let record = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            record = reader.next_record() => record,
        };
        match record {
            Ok(record) => {
                gauge!(m::PIPELINE_QUEUE_DEPTH)
                    .set((records.max_capacity() - records.capacity()) as f64);
                if records.send(record).await.is_err() {
                    debug!("record queue closed, reader exiting");
                    break;
                }
            }
            Err(e) => {
                fatal.raise(format!("binlog reader: {e}"));
                break;
            }
        }
    }
    debug!(resume = %reader.resume_position(), "reader task finished");
}

struct NormalizeTask {
    filter: Arc<ScopeFilter>,
    normalizer: Normalizer,
    records: mpsc::Receiver<StreamRecord>,
    batches: mpsc::Sender<TransactionBatch>,
    cancel: CancellationToken,
    status: ReaderStatusHandle,
    fatal: FatalSignal,
    drain_grace: Duration,
    checkpoint_interval: Duration,
}

impl NormalizeTask {
    async fn run(mut self) {
        // empty batches only advance the checkpoint; hold them back and
        // write at most one per interval
        let mut pending: Option<TransactionBatch> = None;
        let mut last_flush = Instant::now();
        let mut tick = tokio::time::interval(self.checkpoint_interval.max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drain_deadline: Option<Instant> = None;

        loop {
            let record = tokio::select! {
                () = self.cancel.cancelled(), if drain_deadline.is_none() => {
                    self.status.set_state(ReaderState::Draining);
                    if !self.normalizer.in_transaction() {
                        break;
                    }
                    info!(
                        buffered = self.normalizer.buffered(),
                        grace_secs = self.drain_grace.as_secs(),
                        "draining open transaction"
                    );
                    drain_deadline = Some(Instant::now() + self.drain_grace);
                    continue;
                }
                () = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() =>
                {
                    if let Some(txn_id) = self.normalizer.abandon() {
                        warn!(
                            txn_id = %txn_id,
                            "drain grace elapsed, open transaction left for the next run"
                        );
                    }
                    break;
                }
                _ = tick.tick() => {
                    if let Some(batch) = pending.take() {
                        if !self.forward(batch).await {
                            break;
                        }
                        last_flush = Instant::now();
                    }
                    continue;
                }
                record = self.records.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            match self.normalizer.apply(record, &self.filter) {
                Ok(None) => {}
                Ok(Some(batch)) if batch.is_empty() => {
                    if last_flush.elapsed() >= self.checkpoint_interval {
                        pending = None;
                        if !self.forward(batch).await {
                            break;
                        }
                        last_flush = Instant::now();
                    } else {
                        pending = Some(batch);
                    }
                }
                Ok(Some(batch)) => {
                    // supersedes any held-back checkpoint
                    pending = None;
                    if !self.forward(batch).await {
                        break;
                    }
                    last_flush = Instant::now();
                }
                Err(e) => {
                    self.fatal.raise(format!("normalizer: {e}"));
                    break;
                }
            }

            if drain_deadline.is_some() && !self.normalizer.in_transaction() {
                debug!("open transaction finished during drain");
                break;
            }
        }

        if let Some(batch) = pending.take() {
            self.forward(batch).await;
        }
    }

    async fn forward(&self, batch: TransactionBatch) -> bool {
        if self.batches.send(batch).await.is_err() {
            if !self.fatal.is_raised() {
                warn!("batch queue closed");
            }
            return false;
        }
        true
    }
}

async fn run_store(
    store: Arc<ChangeStore>,
    slot: CheckpointSlot,
    mut batches: mpsc::Receiver<TransactionBatch>,
    events: Option<mpsc::Sender<ChangeEvent>>,
    acked: Arc<watch::Sender<Option<Checkpoint>>>,
    fatal: FatalSignal,
) {
    let mut rules_open = events.is_some();
    while let Some(batch) = batches.recv().await {
        let started = std::time::Instant::now();
        let checkpoint = batch.checkpoint();
        let txn_id = batch.txn_id.clone();

        let writer = Arc::clone(&store);
        let target = slot.clone();
        let cp = checkpoint.clone();
        let result = tokio::task::spawn_blocking(move || match &target {
            CheckpointSlot::Store => writer.append_batch(batch.events, Some(&cp)),
            CheckpointSlot::File(file) => {
                let inserted = if batch.events.is_empty() {
                    Vec::new()
                } else {
                    writer.append_batch(batch.events, None)?
                };
                file.save(&cp)?;
                Ok(inserted)
            }
        })
        .await;

        let inserted = match result {
            Ok(Ok(inserted)) => inserted,
            Ok(Err(e)) => {
                fatal.raise(format!("change store: {e}"));
                break;
            }
            Err(e) => {
                fatal.raise(format!("store write panicked: {e}"));
                break;
            }
        };
        histogram!(m::PIPELINE_BATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(
            txn_id = %txn_id,
            inserted = inserted.len(),
            checkpoint = %checkpoint.position,
            "batch stored"
        );
        acked.send_replace(Some(checkpoint));

        if let (true, Some(tx)) = (rules_open, events.as_ref()) {
            for event in inserted {
                if tx.send(event).await.is_err() {
                    warn!("rule task gone, alerting disabled for this run");
                    rules_open = false;
                    break;
                }
            }
        }
    }
}

async fn run_rules(
    mut engine: RuleEngine,
    store: Arc<ChangeStore>,
    mut events: mpsc::Receiver<ChangeEvent>,
    alerts: Option<mpsc::Sender<Alert>>,
) -> RuleEngine {
    let mut downstream_open = alerts.is_some();
    while let Some(event) = events.recv().await {
        let fired = match engine.evaluate(&event) {
            Ok(fired) => fired,
            Err(e) => {
                warn!(error = %e, position = %event.position, "rule evaluation failed");
                continue;
            }
        };

        for alert in fired {
            info!(
                alert_id = %alert.id,
                rule_id = %alert.rule_id,
                severity = %alert.severity,
                "alert raised"
            );

            let writer = Arc::clone(&store);
            let stored = alert.clone();
            match tokio::task::spawn_blocking(move || writer.append_alert(&stored)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(alert_id = %alert.id, error = %e, "failed to store alert"),
                Err(e) => error!(alert_id = %alert.id, error = %e, "alert write panicked"),
            }

            if let (true, Some(tx)) = (downstream_open, alerts.as_ref()) {
                if tx.send(alert).await.is_err() {
                    warn!("alert receiver closed, alerts are stored but not delivered");
                    downstream_open = false;
                }
            }
        }
    }
    engine
}

/// Builder for [`CdcPipeline`].
pub struct CdcPipelineBuilder<C: BinlogConnector + Clone> {
    config: BinwatchConfig,
    connector: C,
    store: Option<Arc<ChangeStore>>,
    alert_tx: Option<mpsc::Sender<Alert>>,
    alert_channel_capacity: usize,
}

impl<C: BinlogConnector + Clone> CdcPipelineBuilder<C> {
    pub fn new(config: BinwatchConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            store: None,
            alert_tx: None,
            alert_channel_capacity: 1024,
        }
    }

    /// Share an already open store (the query API reads the same file).
    pub fn store(mut self, store: Arc<ChangeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Send alerts to an existing channel instead of creating one.
    pub fn alert_sender(mut self, tx: mpsc::Sender<Alert>) -> Self {
        self.alert_tx = Some(tx);
        self
    }

    pub fn alert_channel_capacity(mut self, capacity: usize) -> Self {
        self.alert_channel_capacity = capacity;
        self
    }

    /// Build the pipeline.
    ///
    /// Returns the alert receiver when no sender was supplied and alerting
    /// is enabled.
    pub fn build(self) -> Result<(CdcPipeline<C>, Option<mpsc::Receiver<Alert>>), CdcError> {
        let filter = ScopeFilter::from_config(&self.config.scope)?;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(ChangeStore::open(&self.config.store)?),
        };

        let slot = match self.config.pipeline.position_store {
            PositionStoreKind::Store => CheckpointSlot::Store,
            PositionStoreKind::File => {
                if self.config.pipeline.position_file.is_empty() {
                    return Err(CdcError::Config {
                        field: "pipeline.position_file".to_owned(),
                        reason: "required when position_store = \"file\"".to_owned(),
                    });
                }
                CheckpointSlot::File(Arc::new(FilePositionStore::new(
                    &self.config.pipeline.position_file,
                )))
            }
        };

        let (alert_tx, alert_rx) = match (self.alert_tx, self.config.alerts.enabled) {
            (Some(tx), _) => (Some(tx), None),
            (None, true) => {
                let (tx, rx) = mpsc::channel(self.alert_channel_capacity.max(1));
                (Some(tx), Some(rx))
            }
            (None, false) => (None, None),
        };

        let status = ReaderStatusHandle::new();
        let (acked, _) = watch::channel(None);
        let (fatal_tx, _) = watch::channel(None);

        let pipeline = CdcPipeline {
            info: PluginInfo {
                name: MODULE_CDC_PIPELINE.to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                description: "binlog change capture, storage and rule evaluation".to_owned(),
                plugin_type: PluginType::Pipeline,
            },
            config: self.config,
            state: PluginState::Created,
            connector: self.connector,
            store,
            slot,
            filter: Arc::new(filter),
            engine: None,
            status: status.clone(),
            acked: Arc::new(acked),
            fatal: FatalSignal {
                tx: Arc::new(fatal_tx),
                status,
            },
            alert_tx,
            drain: CancellationToken::new(),
            reader_stop: CancellationToken::new(),
            reader_task: None,
            normalize_task: None,
            store_task: None,
            rule_task: None,
        };
        Ok((pipeline, alert_rx))
    }
}
