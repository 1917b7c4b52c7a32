//! Command-line definitions (clap derive). Declarative only.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// binwatch -- MySQL binlog change capture and alerting.
///
/// Use `binwatch <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "binwatch", version, about, long_about = None)]
pub struct Cli {
    /// Path to the binwatch.toml configuration file.
    #[arg(short, long, global = true, default_value = "/etc/binwatch/binwatch.toml")]
    pub config: PathBuf,

    /// Log level for CLI diagnostics on stderr (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate or display the configuration.
    Config(ConfigArgs),

    /// Validate or list alert rules.
    Rules(RulesArgs),

    /// Query stored change events.
    Changes(ChangesArgs),

    /// Query alerts and their delivery status.
    Alerts(AlertsArgs),

    /// Aggregate statistics over the change store.
    Stats,

    /// Inspect or move the stream checkpoint.
    Checkpoint(CheckpointArgs),

    /// Daemon process, checkpoint and last event.
    Status,
}

// ---- config ----

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Load and validate the configuration file.
    Validate,
    /// Show the effective configuration (file + env overrides + defaults),
    /// with secrets redacted.
    Show {
        /// Only this section (general, source, scope, pipeline, store,
        /// alerts, notify, api, metrics).
        section: Option<String>,
    },
}

// ---- rules ----

#[derive(Args, Debug)]
pub struct RulesArgs {
    #[command(subcommand)]
    pub action: RulesAction,
}

#[derive(Subcommand, Debug)]
pub enum RulesAction {
    /// List inline and directory rules as the daemon would load them.
    List {
        /// Filter by status (enabled, disabled, test).
        #[arg(long)]
        status: Option<String>,
    },
    /// Validate every rule file in a directory.
    Validate {
        /// Rule directory; defaults to `alerts.rule_dir`.
        path: Option<PathBuf>,
    },
}

// ---- changes ----

#[derive(Args, Debug)]
pub struct ChangesArgs {
    #[arg(long)]
    pub database: Option<String>,

    /// Table name, optionally qualified as `db.table`.
    #[arg(long)]
    pub table: Option<String>,

    /// Lower time bound (RFC 3339 or `YYYY-MM-DD[ HH:MM:SS]`, UTC).
    #[arg(long)]
    pub from: Option<String>,

    /// Upper time bound.
    #[arg(long)]
    pub to: Option<String>,

    /// INSERT, UPDATE, DELETE or DDL.
    #[arg(long)]
    pub operation: Option<String>,

    /// Primary key values joined by `,`.
    #[arg(long)]
    pub pk: Option<String>,

    /// Full history of the row given by `--table` and `--pk`, oldest first.
    #[arg(long, requires_all = ["table", "pk"])]
    pub history: bool,

    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}

// ---- alerts ----

#[derive(Args, Debug)]
pub struct AlertsArgs {
    #[arg(long)]
    pub from: Option<String>,

    #[arg(long)]
    pub to: Option<String>,

    /// info, low, medium, high, critical
    #[arg(long)]
    pub severity: Option<String>,

    /// pending, delivered, failed, suppressed
    #[arg(long)]
    pub status: Option<String>,

    #[arg(long)]
    pub rule_id: Option<String>,

    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// Show the delivery attempts of one alert instead of listing alerts.
    #[arg(long, value_name = "ALERT_ID", conflicts_with_all = ["severity", "status", "rule_id"])]
    pub deliveries: Option<String>,
}

// ---- checkpoint ----

#[derive(Args, Debug)]
pub struct CheckpointArgs {
    #[command(subcommand)]
    pub action: CheckpointAction,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointAction {
    /// Show the saved checkpoint.
    Show,
    /// Overwrite the checkpoint. Refused while the daemon is running.
    Reset {
        /// `now`, `earliest` or `<file>:<offset>`. `now` and `earliest` ask
        /// the source server.
        #[arg(long)]
        to: String,
    },
}
