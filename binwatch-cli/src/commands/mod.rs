//! Command handlers, one module per subcommand.

pub mod alerts;
pub mod changes;
pub mod checkpoint;
pub mod config;
pub mod rules;
pub mod stats;
pub mod status;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use binwatch_core::config::BinwatchConfig;
use binwatch_core::types::parse_timestamp;
use binwatch_store::ChangeStore;

use crate::error::CliError;

/// Open the configured change store without write access.
///
/// Read-only opens never create the file, so a missing store is reported
/// instead of silently initialized.
pub(crate) fn open_store(config: &BinwatchConfig) -> Result<ChangeStore, CliError> {
    let path = Path::new(&config.store.path);
    if !path.exists() {
        return Err(CliError::Store(format!(
            "{} does not exist; has the daemon run yet?",
            path.display()
        )));
    }
    debug!(path = %path.display(), "opening change store read-only");
    Ok(ChangeStore::open_read_only(
        path,
        Duration::from_millis(config.store.busy_timeout_ms),
    )?)
}

/// Parse an optional `--from` / `--to` value.
pub(crate) fn time_bound(
    flag: &str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, CliError> {
    value
        .map(|v| {
            parse_timestamp(v).map_err(|e| CliError::Command(format!("--{flag}: {e}")))
        })
        .transpose()
}
