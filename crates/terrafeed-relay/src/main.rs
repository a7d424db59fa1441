//! Relay server binary.
//!
//! Usage: cargo run --release -p terrafeed-relay -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>    JSON config file (default: built-in defaults)
//!   --bind <ADDR>      Listen address (default: 127.0.0.1:9743)
//!   --storage <DIR>    Cell blob directory (default: World1)
//!   --seed <SEED>      World seed handed to peers
//!
//! Dirty cells are flushed every `flush_interval_secs` and once more on
//! ctrl-c or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use terrafeed_relay::{Relay, RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    terrafeed::core::logging::init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => match RelayConfig::load_sync(&PathBuf::from(&path)) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => RelayConfig::default(),
    };
    if let Some(bind) = parse_str_arg(&args, "--bind") {
        config.bind_addr = bind;
    }
    if let Some(storage) = parse_str_arg(&args, "--storage") {
        config.storage_dir = PathBuf::from(storage);
    }
    if let Some(seed) = parse_str_arg(&args, "--seed") {
        config.seed = seed;
    }

    let flush_interval = Duration::from_secs(config.flush_interval_secs.max(1));

    let relay = match Relay::new(config) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            log::error!("Failed to start relay: {}", e);
            std::process::exit(1);
        }
    };

    let _server = match RelayServer::start(relay.clone()).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to bind relay: {}", e);
            std::process::exit(1);
        }
    };

    relay.run_flush_loop(flush_interval, shutdown_signal()).await;
}

/// Resolves on ctrl-c, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received ctrl-c"),
        _ = terminate => log::info!("Received SIGTERM"),
    }
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
