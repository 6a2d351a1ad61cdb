// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Telemetry configuration

use serde::{Deserialize, Serialize};

/// History recording settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable the history recorder task.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Recording interval in milliseconds, valid range [250, 10000].
    #[serde(default = "default_log_interval_ms")]
    pub log_interval_ms: u64,

    /// Maximum number of retained data points.
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

fn default_enabled() -> bool {
    true
}
fn default_log_interval_ms() -> u64 {
    1000
}
fn default_max_points() -> usize {
    // Sized so the ring stays around 500 KiB of fixed-size records.
    (500 * 1024) / std::mem::size_of::<crate::control::telemetry::DataPoint>()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            log_interval_ms: default_log_interval_ms(),
            max_points: default_max_points(),
        }
    }
}
