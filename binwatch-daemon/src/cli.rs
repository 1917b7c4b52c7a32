//! CLI argument definitions for binwatch-daemon.

use std::path::PathBuf;

use clap::Parser;

/// binwatch change-data-capture daemon.
///
/// Streams the MySQL binlog into the change store, evaluates alert rules,
/// delivers notifications and serves the read-only query API.
#[derive(Parser, Debug)]
#[command(name = "binwatch-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to binwatch.toml configuration file.
    #[arg(short, long, default_value = "/etc/binwatch/binwatch.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path. An empty value disables the PID file.
    #[arg(long)]
    pub pid_file: Option<String>,

    /// Keep serving queries after a fatal ingestion error instead of exiting.
    #[arg(long)]
    pub no_exit_on_fatal: bool,
}
