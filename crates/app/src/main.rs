//! Dotlink - socket toolkit daemon
//!
//! Runs a TCP echo server, a UDP echo endpoint and an optional probe client
//! as described by a TOML config file.
//!
//! Usage: `dotlink [config.toml]`. Without a file the standard ports are used.

use std::path::PathBuf;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod daemon;

use config::DaemonConfig;
use daemon::Daemon;

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Dotlink");

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => match DaemonConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => DaemonConfig::standard(),
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(config));
    std::process::exit(exit_code);
}

async fn run(config: DaemonConfig) -> i32 {
    let daemon = Daemon::start(&config);
    if daemon.is_idle() {
        tracing::error!("No handler could be started");
        return 1;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, shutting down"),
            Err(e) => {
                tracing::warn!("Cannot listen for interrupts, running until killed: {}", e);
                std::future::pending::<()>().await;
            }
        }
        let _ = stop_tx.send(true);
    });

    daemon.run(stop_rx).await;
    daemon.shutdown().await;
    0
}
