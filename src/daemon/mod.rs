// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Module
//!
//! Background services of the oven controller: the sensor reader, the fixed
//! period control loop, the telemetry recorder and a heartbeat monitor.
//!
//! ## Usage
//!
//! ```no_run
//! use reflowd::{config::Config, daemon::launch_daemon::Daemon};
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml")?;
//!     let config_arc = Arc::new(RwLock::new(config));
//!
//!     // Create and launch daemon
//!     let mut daemon = Daemon::new();
//!     daemon.launch(config_arc).await?;
//!
//!     // Wait for shutdown signal (e.g., Ctrl+C)
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Clean shutdown
//!     daemon.shutdown();
//!     daemon.join().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod launch_daemon;

pub use launch_daemon::Daemon;
