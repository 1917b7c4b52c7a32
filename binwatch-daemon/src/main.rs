use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use binwatch_core::config::BinwatchConfig;
use binwatch_daemon::cli::DaemonCli;
use binwatch_daemon::{ExitReason, Orchestrator, logging};

/// Exit status after a fatal ingestion error.
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = DaemonCli::parse();
    match run(cli).await {
        Ok(None) | Ok(Some(ExitReason::Signal(_))) => ExitCode::SUCCESS,
        Ok(Some(ExitReason::Fatal(_))) => ExitCode::from(EXIT_FATAL),
        Err(e) => {
            // The subscriber may not be installed yet.
            eprintln!("binwatch-daemon: {e:#}");
            tracing::error!(error = format!("{e:#}"), "binwatch-daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: DaemonCli) -> Result<Option<ExitReason>> {
    let mut config = BinwatchConfig::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;
    apply_cli_overrides(&mut config, &cli);
    config.validate().context("config validation failed")?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(None);
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "binwatch-daemon starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config)?;
    let reason = orchestrator.run().await?;
    Ok(Some(reason))
}

fn apply_cli_overrides(config: &mut BinwatchConfig, cli: &DaemonCli) {
    if let Some(level) = &cli.log_level {
        config.general.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.general.log_format = format.clone();
    }
    if let Some(pid_file) = &cli.pid_file {
        config.general.pid_file = pid_file.clone();
    }
    if cli.no_exit_on_fatal {
        config.general.exit_on_fatal = false;
    }
}
