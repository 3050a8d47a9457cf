//! slotwire CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::Level;

use slotwire_client::cli::{Cli, Command, ConfigAction};
use slotwire_client::commands;
use slotwire_client::config::ClientConfig;
use slotwire_client::error::{ClientError, ClientResult};
use slotwire_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let tracing = if cli.debug {
        TracingConfig::cli_debug()
    } else {
        TracingConfig::default().with_level(Level::WARN)
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    // Run the command
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config {
        ClientConfig::load_from(path).map_err(ClientError::Config)?
    } else {
        ClientConfig::load().unwrap_or_default()
    };

    match cli.command {
        Command::Serve {
            port,
            max_concurrent,
            backlog,
        } => commands::serve::run(port, max_concurrent, backlog).await,
        Command::Bench {
            addr,
            tasks,
            duration,
        } => commands::bench::run(&config, addr, tasks, duration).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
