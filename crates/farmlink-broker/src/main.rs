// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Farmlink Broker
//!
//! Relay broker connecting field chips (sensor/actuator controllers) to
//! monitoring clients:
//! - routes actuator commands and sensor requests to chips
//! - fans chip reports out to subscribed clients
//! - periodically polls stale chips and archives readings to SQLite
//!
//! # Usage
//!
//! ```bash
//! # Start broker on default port (3000)
//! farmlink-broker
//!
//! # Custom port and config
//! farmlink-broker --port 4010 --config broker.json
//!
//! # Tighter archival cadence
//! farmlink-broker --archival-interval 300
//! ```

use clap::Parser;
use farmlink_broker::{Broker, BrokerConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Farmlink Broker - Relay between field chips and monitoring clients
#[derive(Parser, Debug)]
#[command(name = "farmlink-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll scheduler period in seconds
    #[arg(long, default_value = "60")]
    poll_interval: u64,

    /// Minimum seconds between archived readings per chip
    #[arg(long, default_value = "1800")]
    archival_interval: u64,

    /// SQLite database path for archived readings
    #[arg(long, default_value = "farmlink.db")]
    db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Load or create config
    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        BrokerConfig::from_file(&config_path)?
    } else {
        BrokerConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            poll_interval_secs: args.poll_interval,
            archival_interval_secs: args.archival_interval,
            db_path: args.db_path,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       Farmlink Broker v{}                       |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!(
        "|  Bind:     {:38} |",
        format!("{}:{}", config.bind_address, config.port)
    );
    info!(
        "|  Poll:     {:38} |",
        format!("{}s", config.poll_interval_secs)
    );
    info!(
        "|  Archival: {:38} |",
        format!("{}s", config.archival_interval_secs)
    );
    info!("|  Archive:  {:38} |", config.db_path);
    info!("+----------------------------------------------------+");

    // Create and run broker
    let broker = Broker::new(config)?;

    // Handle shutdown signals
    let broker_handle = broker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping broker...");
        broker_handle.shutdown().await;
    });

    // Run broker
    broker.run().await?;

    info!("Broker stopped");
    Ok(())
}
