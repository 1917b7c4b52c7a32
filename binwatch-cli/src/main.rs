use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use binwatch_cli::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // diagnostics go to stderr so stdout stays parseable with --output json
    let filter = cli
        .log_level
        .as_deref()
        .map(EnvFilter::new)
        .unwrap_or_else(|| {
            EnvFilter::try_from_env("BINWATCH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match binwatch_cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
