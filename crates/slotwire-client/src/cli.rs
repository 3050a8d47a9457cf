//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use slotwire_server::{DEFAULT_BACKLOG, DEFAULT_MAX_CONCURRENT_REQUESTS};

use crate::config::DEFAULT_PORT;

/// slotwire - pipelined binary RPC over TCP
#[derive(Debug, Parser)]
#[command(name = "slotwire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "SLOTWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the demo server in the foreground
    Serve {
        /// Port to listen on (0 picks a free one)
        #[arg(long, short, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Requests a single connection may have in flight
        #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_REQUESTS)]
        max_concurrent: usize,

        /// Listen backlog
        #[arg(long, default_value_t = DEFAULT_BACKLOG)]
        backlog: u32,
    },

    /// Load-test a demo server
    Bench {
        /// Server address (defaults to `server_addr` from the config)
        #[arg(long, short)]
        addr: Option<String>,

        /// Concurrent request loops
        #[arg(long, short, default_value_t = 8)]
        tasks: usize,

        /// Run time in seconds
        #[arg(long, short, default_value_t = 10)]
        duration: u64,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["slotwire", "serve"]).unwrap();
        assert!(!cli.debug);
        match cli.command {
            Command::Serve {
                port,
                max_concurrent,
                backlog,
            } => {
                assert_eq!(port, DEFAULT_PORT);
                assert_eq!(max_concurrent, DEFAULT_MAX_CONCURRENT_REQUESTS);
                assert_eq!(backlog, DEFAULT_BACKLOG);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn bench_flags() {
        let cli = Cli::try_parse_from([
            "slotwire", "-v", "--config", "/tmp/sw.toml", "bench", "-a", "10.0.0.1:7000", "-t",
            "32", "-d", "3",
        ])
        .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sw.toml")));
        match cli.command {
            Command::Bench {
                addr,
                tasks,
                duration,
            } => {
                assert_eq!(addr.as_deref(), Some("10.0.0.1:7000"));
                assert_eq!(tasks, 32);
                assert_eq!(duration, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["slotwire"]).is_err());
    }
}
