//! `binwatch checkpoint` handler.
//!
//! The checkpoint lives wherever `pipeline.position_store` points: the
//! change store's single-row table, or a JSON file. Resetting is refused
//! while a daemon holds the PID file, since the daemon would overwrite the
//! new value with its next commit.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use binwatch_binlog::{BinlogConnector, MysqlConnector};
use binwatch_core::config::{BinwatchConfig, PositionStoreKind, StartMode};
use binwatch_core::types::{Checkpoint, StreamPosition};
use binwatch_store::{ChangeStore, FilePositionStore, PositionStore};

use super::status::running_daemon;
use crate::cli::{CheckpointAction, CheckpointArgs};
use crate::error::CliError;
use crate::output::{OutputWriter, Render, timestamp};

pub async fn execute(
    args: CheckpointArgs,
    config_path: &Path,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = BinwatchConfig::load(config_path).await?;
    let slot = CheckpointSlot::from_config(&config);

    let report = match args.action {
        CheckpointAction::Show => CheckpointReport {
            slot: slot.describe(),
            checkpoint: slot.load()?,
            previous: None,
        },
        CheckpointAction::Reset { to } => {
            let connector = MysqlConnector::new(config.source.clone());
            reset(&config, &slot, &to, &connector).await?
        }
    };
    writer.render(&report)?;
    Ok(())
}

/// `--to` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetTarget {
    /// Ask the source server.
    Mode(StartMode),
    Position(StreamPosition),
}

impl ResetTarget {
    pub fn parse(s: &str) -> Result<Self, CliError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "now" => Ok(Self::Mode(StartMode::Now)),
            "earliest" => Ok(Self::Mode(StartMode::Earliest)),
            _ => s.parse::<StreamPosition>().map(Self::Position).map_err(|e| {
                CliError::Command(format!("--to: {e} (expected now, earliest or file:offset)"))
            }),
        }
    }
}

/// Overwrite the checkpoint with `target`, resolving `now` / `earliest`
/// through `connector`.
pub async fn reset<C: BinlogConnector>(
    config: &BinwatchConfig,
    slot: &CheckpointSlot,
    target: &str,
    connector: &C,
) -> Result<CheckpointReport, CliError> {
    let target = ResetTarget::parse(target)?;
    if let Some(pid) = running_daemon(&config.general.pid_file) {
        return Err(CliError::DaemonRunning { pid });
    }

    let position = match target {
        ResetTarget::Position(position) => position,
        ResetTarget::Mode(mode) => {
            info!(
                host = %config.source.host,
                port = config.source.port,
                ?mode,
                "resolving position from source"
            );
            connector.resolve_start(mode).await?
        }
    };
    if position.offset < 4 {
        return Err(CliError::Command(format!(
            "--to: offset {} is inside the file header; the first event starts at 4",
            position.offset
        )));
    }

    let previous = slot.load()?;
    let checkpoint = Checkpoint::at_commit(position);
    slot.save(config, &checkpoint)?;
    info!(
        checkpoint = %checkpoint,
        previous = previous.as_ref().map(|c| c.to_string()),
        slot = %slot.describe(),
        "checkpoint reset"
    );

    Ok(CheckpointReport {
        slot: slot.describe(),
        checkpoint: Some(checkpoint),
        previous: Some(previous),
    })
}

/// Where the daemon keeps its checkpoint.
#[derive(Debug, Clone)]
pub enum CheckpointSlot {
    Store { path: PathBuf, busy_timeout: Duration },
    File(FilePositionStore),
}

impl CheckpointSlot {
    pub fn from_config(config: &BinwatchConfig) -> Self {
        match config.pipeline.position_store {
            PositionStoreKind::Store => Self::Store {
                path: PathBuf::from(&config.store.path),
                busy_timeout: Duration::from_millis(config.store.busy_timeout_ms),
            },
            PositionStoreKind::File => {
                Self::File(FilePositionStore::new(&config.pipeline.position_file))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Store { path, .. } => format!("store {}", path.display()),
            Self::File(file) => format!("file {}", file.path().display()),
        }
    }

    /// Saved checkpoint; a store that was never created has none.
    pub fn load(&self) -> Result<Option<Checkpoint>, CliError> {
        match self {
            Self::Store { path, busy_timeout } => {
                if !path.exists() {
                    return Ok(None);
                }
                Ok(ChangeStore::open_read_only(path, *busy_timeout)?.load()?)
            }
            Self::File(file) => Ok(file.load()?),
        }
    }

    fn save(&self, config: &BinwatchConfig, checkpoint: &Checkpoint) -> Result<(), CliError> {
        match self {
            // opening for write creates the schema on first use
            Self::Store { .. } => ChangeStore::open(&config.store)?.save(checkpoint)?,
            Self::File(file) => file.save(checkpoint)?,
        }
        Ok(())
    }
}

#[derive(Serialize)]
pub struct CheckpointReport {
    pub slot: String,
    pub checkpoint: Option<Checkpoint>,
    /// Set by `reset`: what was there before (possibly nothing).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Option<Checkpoint>>,
}

impl Render for CheckpointReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        if let Some(previous) = &self.previous {
            let before = previous
                .as_ref()
                .map_or_else(|| "none".to_owned(), ToString::to_string);
            writeln!(w, "Checkpoint reset [{}]", self.slot)?;
            writeln!(w, "  Previous: {before}")?;
        } else {
            writeln!(w, "Checkpoint [{}]", self.slot)?;
        }

        match &self.checkpoint {
            Some(cp) => {
                writeln!(w, "  Position: {}", cp.position.to_string().bold())?;
                writeln!(
                    w,
                    "  Boundary: {}",
                    if cp.tx_boundary {
                        "transaction commit".normal()
                    } else {
                        "mid-transaction".yellow()
                    }
                )?;
                writeln!(w, "  Updated:  {}", timestamp(Some(cp.updated_at)))
            }
            None => writeln!(
                w,
                "  {}",
                "none; the daemon will cold-start per source.start_mode".yellow()
            ),
        }
    }
}
