//! Health aggregation and the ingestion indicator.
//!
//! The daemon status is the worst status among its plugins:
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reasons)
//! - Any Unhealthy -> Unhealthy(reasons)
//!
//! [`IngestionMonitor`] reads the pipeline's status, checkpoint and fatal
//! channels without touching the pipeline itself, so the query API can
//! report lag and halts while ingestion is degraded or stopped.

use binwatch_binlog::{ReaderState, ReaderStatusHandle};
use binwatch_core::pipeline::HealthStatus;
use binwatch_core::types::Checkpoint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Aggregated health report for the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub modules: Vec<ModuleHealth>,
}

/// Health of one registered plugin.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleHealth {
    pub name: String,
    pub status: HealthStatus,
}

/// Worst status of `modules`, with every non-healthy reason.
pub fn aggregate_status(modules: &[ModuleHealth]) -> HealthStatus {
    let mut worst = HealthStatus::Healthy;
    let mut reasons = Vec::new();

    for module in modules {
        match &module.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                reasons.push(format!("{}: {}", module.name, reason));
                if !worst.is_unhealthy() {
                    worst = HealthStatus::Degraded(String::new());
                }
            }
            HealthStatus::Unhealthy(reason) => {
                reasons.push(format!("{}: {}", module.name, reason));
                worst = HealthStatus::Unhealthy(String::new());
            }
        }
    }

    match worst {
        HealthStatus::Healthy => HealthStatus::Healthy,
        HealthStatus::Degraded(_) => HealthStatus::Degraded(reasons.join("; ")),
        HealthStatus::Unhealthy(_) => HealthStatus::Unhealthy(reasons.join("; ")),
    }
}

/// Ingestion indicator attached to every query response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionStatus {
    pub state: ReaderState,
    pub lag_secs: Option<i64>,
    pub last_checkpoint: Option<String>,
    pub checkpoint_updated_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub reconnects: u64,
    /// Set once ingestion halted on a fatal error.
    pub fatal: Option<String>,
    /// True when stored data may be behind the source: not streaming,
    /// halted, or lagging past the threshold.
    pub stale: bool,
}

/// Read-only view onto the pipeline's status channels.
#[derive(Debug, Clone)]
pub struct IngestionMonitor {
    status: ReaderStatusHandle,
    checkpoints: watch::Receiver<Option<Checkpoint>>,
    fatal: watch::Receiver<Option<String>>,
    lag_degraded_secs: u64,
}

impl IngestionMonitor {
    pub fn new(
        status: ReaderStatusHandle,
        checkpoints: watch::Receiver<Option<Checkpoint>>,
        fatal: watch::Receiver<Option<String>>,
        lag_degraded_secs: u64,
    ) -> Self {
        Self {
            status,
            checkpoints,
            fatal,
            lag_degraded_secs,
        }
    }

    pub fn snapshot(&self) -> IngestionStatus {
        let status = self.status.current();
        let checkpoint = self.checkpoints.borrow().clone();
        let fatal = self.fatal.borrow().clone();

        let lagging = status
            .lag_secs
            .is_some_and(|lag| lag > i64::try_from(self.lag_degraded_secs).unwrap_or(i64::MAX));
        let stale = fatal.is_some() || status.state != ReaderState::Streaming || lagging;

        IngestionStatus {
            state: status.state,
            lag_secs: status.lag_secs,
            last_checkpoint: checkpoint.as_ref().map(|cp| cp.position.to_string()),
            checkpoint_updated_at: checkpoint.map(|cp| cp.updated_at),
            last_event_at: status.last_event_at,
            reconnects: status.reconnects,
            fatal: fatal.or(status.last_error.filter(|_| status.state == ReaderState::Failed)),
            stale,
        }
    }

    /// Health derived from the snapshot.
    pub fn health(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        if let Some(reason) = snapshot.fatal {
            return HealthStatus::Unhealthy(format!("ingestion halted: {reason}"));
        }
        match snapshot.state {
            ReaderState::Streaming => match snapshot.lag_secs {
                Some(lag) if snapshot.stale => {
                    HealthStatus::Degraded(format!("replication lag {lag}s"))
                }
                _ => HealthStatus::Healthy,
            },
            ReaderState::Failed => HealthStatus::Unhealthy("reader failed".to_owned()),
            ReaderState::Stopped => HealthStatus::Unhealthy("ingestion stopped".to_owned()),
            state => HealthStatus::Degraded(format!("reader {}", state.as_str())),
        }
    }
}
