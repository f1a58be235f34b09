// src/main.rs

//! The main entry point for the spoolbridge daemon.

use anyhow::Result;
use spoolbridge::config::Config;
use spoolbridge::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("spoolbridge version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "spoolbridge.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("spoolbridge.toml");

    // Collect -o key=value overrides, applied on top of the file.
    let mut overrides = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "-o" {
            match args.get(i + 1).and_then(|kv| kv.split_once('=')) {
                Some((key, value)) => {
                    overrides.push((key.to_string(), value.to_string()));
                    i += 1;
                }
                None => {
                    eprintln!("-o requires key=value");
                    std::process::exit(1);
                }
            }
        }
        i += 1;
    }

    // Load the daemon configuration. If loading fails, print the error and
    // exit; the daemon cannot run without a valid configuration.
    let config = match Config::load(config_path, &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Setup logging with reloading capabilities. Get the initial log level
    // from the environment or the config.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    // Create a reloadable filter layer.
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    // Initialize the global subscriber with the reload and formatting layers.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true), // Enable ANSI color codes for log levels.
        )
        .init();

    // Store the handle in an Arc to be used for dynamic log level changes.
    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = server::run(config, reload_handle).await {
        error!("Daemon runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
