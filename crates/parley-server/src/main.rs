//! Main entry point for the Parley server.
//!
//! One binary, three roles: `peer`, `reference` and `proxy`.

use clap::Parser;
use tracing::info;

use parley_server::{
    Cli, Role, load_configuration, metrics,
    startup::{self, LoggingConfig},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = load_configuration(&cli)?;

    let _logging_guard = startup::init_logging(&LoggingConfig::from_env())?;

    metrics::init_metrics();
    if let Some(address) = configuration.metrics_address() {
        metrics::install_exporter(&address)?;
    }

    let shutdown = startup::wait_for_shutdown_signal().await;
    info!("Starting parley-server as {}", cli.role.name());

    match cli.role {
        Role::Peer { .. } => startup::run_peer(&configuration, shutdown).await,
        Role::Reference { .. } => startup::run_reference(&configuration, shutdown).await,
        Role::Proxy { .. } => startup::run_proxy(&configuration, shutdown).await,
    }
}
