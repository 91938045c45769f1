//! `homeassistant` server binary
//!
//! Loads `configuration.yaml`, sets up the built-in integrations and runs
//! until interrupted.

mod bootstrap;
mod flow;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use ha_config::HomeConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bootstrap::Server;

#[derive(Debug, Parser)]
#[command(name = "homeassistant", version, about = "Home automation server")]
struct Cli {
    /// Directory holding configuration.yaml and .storage/
    #[arg(short, long, env = "HASS_CONFIG", default_value = "./config")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server until Ctrl-C
    Run,
    /// Add an integration by driving its config flow
    Flow {
        /// Integration domain, e.g. homewizard
        domain: String,
        /// Values for the first form, as key=value
        #[arg(value_parser = flow::parse_field)]
        fields: Vec<(String, serde_json::Value)>,
    },
    /// List the stored config entries
    Entries,
}

/// `RUST_LOG` wins over the `logger:` section
fn init_tracing(config: &HomeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logger.filter_directives()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = HomeConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    init_tracing(&config);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Flow { domain, fields } => {
            let server = Server::start(&config).await?;
            let outcome = flow::run(&server, &domain, fields.into_iter().collect()).await;
            server.stop().await?;
            outcome
        }
        Command::Entries => {
            let server = Server::load(&config).await?;
            server.print_entries();
            Ok(())
        }
    }
}

async fn run(config: HomeConfig) -> Result<()> {
    info!(name = %config.core.name, config_dir = %config.config_dir.display(), "Starting");
    let server = Server::start(&config).await?;
    server.setup_yaml_platforms(&config).await;
    server.setup_entries().await;
    server.started();
    info!(entities = server.hass.entities.len(), "Running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down");
    server.stop().await
}
