// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the reflow oven controller daemon

use anyhow::Result;
use clap::Parser;
use log::info;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::RwLock;

use reflowd::config::Config;
use reflowd::daemon::launch_daemon::Daemon;

/// Reflow oven controller daemon
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control tick period override in milliseconds
    #[arg(long)]
    tick_interval_ms: Option<u64>,

    /// Path of the persistent settings store
    #[arg(long)]
    settings_file: Option<String>,

    /// Disable the telemetry history recorder
    #[arg(long, default_value_t = false)]
    no_telemetry: bool,

    /// Output the default configuration as YAML and exit
    #[arg(long, default_value_t = false)]
    show_default_config: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.show_default_config {
        let yaml = serde_yml::to_string(&Config::default())?;
        println!("{}", yaml);
        return Ok(());
    }

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let mut config = Config::from_file(&config_path)?;

    // Apply command line overrides
    config.apply_args(
        args.tick_interval_ms,
        args.settings_file.clone(),
        if args.no_telemetry { Some(false) } else { None },
    );
    Config::validate_specific_rules(&config)?;

    info!("starting reflowd");
    let mut daemon = Daemon::new();
    let config_arc = Arc::new(RwLock::new(config));
    daemon.launch(config_arc).await?;

    // Wait for termination signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal, terminating daemon");
            daemon.shutdown();
            daemon.join().await?;
        }
        Err(err) => {
            eprintln!("Error waiting for shutdown signal: {}", err);
        }
    }

    Ok(())
}
