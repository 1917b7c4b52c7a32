//! binwatch command-line interface.
//!
//! Offline tooling over the daemon's configuration, rules, change store and
//! checkpoint. Nothing here talks to a running daemon.

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

use cli::{Cli, Commands};
use error::CliError;
use output::OutputWriter;

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let writer = OutputWriter::new(cli.output);
    let config = cli.config.as_path();

    match cli.command {
        Commands::Config(args) => commands::config::execute(args, config, &writer).await,
        Commands::Rules(args) => commands::rules::execute(args, config, &writer).await,
        Commands::Changes(args) => commands::changes::execute(args, config, &writer).await,
        Commands::Alerts(args) => commands::alerts::execute(args, config, &writer).await,
        Commands::Stats => commands::stats::execute(config, &writer).await,
        Commands::Checkpoint(args) => commands::checkpoint::execute(args, config, &writer).await,
        Commands::Status => commands::status::execute(config, &writer).await,
    }
}
