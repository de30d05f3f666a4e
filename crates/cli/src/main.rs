//! podnetctl - operator CLI for the podnet node daemon
//!
//! Talks to the daemon's HTTP API on the node: resource mapping dumps,
//! health, and the effective configuration.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// CLI for the podnet node daemon
#[derive(Parser)]
#[command(name = "podnetctl")]
#[command(author, version, about = "Operator CLI for the podnet node daemon", long_about = None)]
pub struct Cli {
    /// Daemon API endpoint (can also be set via PODNET_API_URL)
    #[arg(long, env = "PODNET_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dump the three-way resource mapping (pool / cloud / pod bindings)
    Mapping {
        /// Only show entries that failed validation
        #[arg(long)]
        invalid_only: bool,
    },

    /// Show daemon component health
    Health,

    /// Show the daemon's mode and per-pod resource bindings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = client::DaemonClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Mapping { invalid_only } => {
            commands::mapping::run(&client, cli.format, invalid_only).await
        }
        Commands::Health => commands::health::run(&client, cli.format).await,
        Commands::Config => commands::config::run(&client, cli.format).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn mapping_flags_parse() {
        let cli = Cli::parse_from(["podnetctl", "mapping", "--invalid-only"]);
        match cli.command {
            Commands::Mapping { invalid_only } => assert!(invalid_only),
            _ => panic!("expected mapping command"),
        }
    }

    #[test]
    fn api_url_flag_overrides_default() {
        let cli = Cli::parse_from(["podnetctl", "--api-url", "http://node:9000", "health"]);
        assert_eq!(cli.api_url, "http://node:9000");
    }
}
