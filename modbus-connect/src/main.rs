//! Modbus Connect daemon.
//!
//! Polls Modbus TCP gateways for the configured entities and keeps the
//! latest decoded value per entity available.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use modbus_connect::config::ConnectConfig;
use modbus_connect_core::{LoggingConfig, PollCoordinator, close_all, get_connection, init_tracing};

/// Modbus TCP polling daemon.
#[derive(Parser, Debug)]
#[command(name = "modbus-connect")]
#[command(about = "Polls Modbus TCP gateways for configured entities")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "modbus-connect.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConnectConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    init_tracing(&log_config)?;

    info!("Starting modbus-connect");
    info!("Loaded configuration from {:?}", args.config);

    let mut coordinators = Vec::new();
    for gateway_config in &config.gateways {
        let gateway = get_connection(&gateway_config.host, gateway_config.port);

        // The first connect decides readiness; once running, poll
        // failures only log and retry on the next cycle.
        gateway
            .try_connect()
            .await
            .with_context(|| format!("Gateway {} not ready", gateway.key()))?;

        let entities = gateway_config
            .slave_entities()
            .with_context(|| format!("Invalid entities for gateway {}", gateway.key()))?;

        info!(
            "Polling {} entities via {} (slave {}) every {}s",
            entities.len(),
            gateway.key(),
            gateway_config.slave_id,
            gateway_config.refresh_interval_seconds
        );

        let coordinator = Arc::new(PollCoordinator::new(
            gateway,
            Duration::from_secs(gateway_config.refresh_interval_seconds),
        ));
        coordinator.set_max_read_size(gateway_config.max_read_size);
        coordinator.set_entities(entities);
        coordinator.start();
        coordinators.push(coordinator);
    }

    info!(
        "modbus-connect running with {} gateway(s)",
        coordinators.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    for coordinator in &coordinators {
        coordinator.stop();
    }
    close_all().await;
    info!("modbus-connect stopped");

    Ok(())
}
