//! `binwatch status` handler: daemon process, saved checkpoint and the
//! newest stored event.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use binwatch_core::config::BinwatchConfig;
use binwatch_core::types::Checkpoint;

use super::checkpoint::CheckpointSlot;
use super::open_store;
use crate::error::CliError;
use crate::output::{OutputWriter, Render, timestamp};

pub async fn execute(config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    let config = BinwatchConfig::load(config_path).await?;
    let report = build_status_report(&config);
    writer.render(&report)?;
    Ok(())
}

/// Never fails: every part that cannot be read is reported as unknown.
pub fn build_status_report(config: &BinwatchConfig) -> StatusReport {
    let daemon_pid = running_daemon(&config.general.pid_file);

    let slot = CheckpointSlot::from_config(config);
    let (checkpoint, checkpoint_error) = match slot.load() {
        Ok(cp) => (cp, None),
        Err(e) => (None, Some(e.to_string())),
    };

    let stats = open_store(config).and_then(|s| s.stats().map_err(CliError::from));
    let (total_changes, last_event_at) = match stats {
        Ok(stats) => (Some(stats.total_changes), stats.last_event_at),
        Err(e) => {
            debug!(error = %e, "change store unavailable");
            (None, None)
        }
    };

    StatusReport {
        daemon_running: daemon_pid.is_some(),
        pid: daemon_pid,
        pid_file: config.general.pid_file.clone(),
        checkpoint_slot: slot.describe(),
        checkpoint,
        checkpoint_error,
        total_changes,
        last_event_at,
        lag_secs: last_event_at.map(|t| (Utc::now() - t).num_seconds().max(0)),
    }
}

/// PID of the daemon holding `pid_file`, if that process is alive.
pub fn running_daemon(pid_file: &str) -> Option<u32> {
    if pid_file.is_empty() {
        return None;
    }
    let path = Path::new(pid_file);
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!(pid_file, error = %e, "no readable pid file");
            return None;
        }
    };
    let pid = match content.trim().parse::<u32>() {
        Ok(pid) => pid,
        Err(e) => {
            warn!(pid_file, error = %e, "failed to parse pid");
            return None;
        }
    };
    is_process_alive(pid).then_some(pid)
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with signal 0 only checks for existence and permission.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    // exists, but owned by another user
    std::io::Error::last_os_error().kind() == std::io::ErrorKind::PermissionDenied
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    warn!("process liveness check not supported on this platform");
    false
}

#[derive(Serialize)]
pub struct StatusReport {
    pub daemon_running: bool,
    pub pid: Option<u32>,
    pub pid_file: String,
    pub checkpoint_slot: String,
    pub checkpoint: Option<Checkpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_error: Option<String>,
    pub total_changes: Option<u64>,
    pub last_event_at: Option<DateTime<Utc>>,
    /// Seconds between now and the newest stored event.
    pub lag_secs: Option<i64>,
}

impl Render for StatusReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "{}", "binwatch status".bold())?;
        match self.pid {
            Some(pid) => writeln!(w, "  Daemon:     {} (pid {pid})", "running".green())?,
            None => writeln!(w, "  Daemon:     {}", "not running".red())?,
        }

        match (&self.checkpoint, &self.checkpoint_error) {
            (_, Some(err)) => writeln!(w, "  Checkpoint: {} ({err})", "unreadable".red())?,
            (Some(cp), None) => writeln!(
                w,
                "  Checkpoint: {} saved {} [{}]",
                cp.to_string().bold(),
                timestamp(Some(cp.updated_at)),
                self.checkpoint_slot
            )?,
            (None, None) => writeln!(
                w,
                "  Checkpoint: {} [{}]",
                "none (cold start)".yellow(),
                self.checkpoint_slot
            )?,
        }

        match self.total_changes {
            Some(total) => writeln!(w, "  Changes:    {total}")?,
            None => writeln!(w, "  Changes:    {}", "store unavailable".dimmed())?,
        }
        write!(w, "  Last event: {}", timestamp(self.last_event_at))?;
        match self.lag_secs {
            Some(lag) => writeln!(w, " ({lag}s ago)"),
            None => writeln!(w),
        }
    }
}
