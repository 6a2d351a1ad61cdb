// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Configuration management
//!
//! YAML configuration for the oven controller. Sections use serde defaults
//! throughout so a minimal (or absent) file boots a working system; an
//! invalid file produces a `config.sample.yaml` next to it for the operator
//! to edit.
//!
//! ```no_run
//! use reflowd::config::Config;
//!
//! let mut config = Config::from_file("config.yaml").unwrap();
//! config.apply_args(Some(500), None, Some(false));
//! println!("tick every {} ms", config.controller.tick_interval_ms);
//! ```

mod controller;
mod hardware;
mod telemetry;

pub use controller::{ControllerConfig, DoorConfig, GainBankConfig, PidConfig};
pub use hardware::{HardwareConfig, HardwareDriverKind, MockPlantConfig};
pub use telemetry::TelemetryConfig;

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Regulation loop settings.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Hardware backend settings.
    #[serde(default)]
    pub hardware: HardwareConfig,

    /// History recorder settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Path of the persistent key-value settings store.
    #[serde(default = "default_settings_file")]
    pub settings_file: String,
}

fn default_settings_file() -> String {
    "reflowd-settings.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            hardware: HardwareConfig::default(),
            telemetry: TelemetryConfig::default(),
            settings_file: default_settings_file(),
        }
    }
}

impl Config {
    /// Write a `*.sample.yaml` with default values next to a rejected file.
    fn create_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let sample_path = path.as_ref().with_extension("sample.yaml");
        if let Some(parent) = sample_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory for sample config at {:?}", parent)
                })?;
            }
        }

        Self::default()
            .save_to_file(&sample_path)
            .with_context(|| format!("Failed to save sample config to {:?}", sample_path))?;

        error!(
            "Sample configuration file created at {:?}\nPlease edit and rename it",
            sample_path
        );
        Ok(())
    }

    /// Load configuration from a file, creating a default file when missing.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("configuration file not found at {:?}, creating default", path);
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        let config: Config = match serde_yml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                error!("configuration deserialization error: {}", err);
                if let Err(sample_err) = Self::create_sample_config(path) {
                    error!("failed to create sample config: {}", sample_err);
                }
                anyhow::bail!(
                    "Failed to deserialize configuration from {}: {}",
                    path.display(),
                    err
                );
            }
        };

        if let Err(err) = Self::validate_specific_rules(&config) {
            error!("configuration validation error: {}", err);
            Self::create_sample_config(path)?;
            return Err(err);
        }

        Ok(config)
    }

    /// Save the configuration to a file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;
        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Apply command line overrides. Only values actually provided replace
    /// the file contents.
    pub fn apply_args(
        &mut self,
        tick_interval_ms: Option<u64>,
        settings_file: Option<String>,
        telemetry_enabled: Option<bool>,
    ) {
        if let Some(tick) = tick_interval_ms {
            debug!("overriding tick interval from command line: {} ms", tick);
            self.controller.tick_interval_ms = tick;
        }
        if let Some(path) = settings_file {
            debug!("overriding settings file from command line: {}", path);
            self.settings_file = path;
        }
        if let Some(enabled) = telemetry_enabled {
            debug!("overriding telemetry enable from command line: {}", enabled);
            self.telemetry.enabled = enabled;
        }
    }

    /// Cross-field rules that serde cannot express.
    pub fn validate_specific_rules(config: &Config) -> Result<()> {
        debug!("performing additional validation checks");

        let ctl = &config.controller;
        if !(50..=5000).contains(&ctl.tick_interval_ms) {
            anyhow::bail!("tick_interval_ms must be in [50, 5000], got {}", ctl.tick_interval_ms);
        }
        if ctl.pwm_period_ms == 0 {
            anyhow::bail!("pwm_period_ms must be > 0");
        }
        if ctl.input_filter_ms <= 0.0 {
            anyhow::bail!("input_filter_ms must be > 0, got {}", ctl.input_filter_ms);
        }
        if ctl.input_channels.is_empty() {
            anyhow::bail!("input_channels must not be empty");
        }
        for &channel in &ctl.input_channels {
            if channel > 7 {
                anyhow::bail!("input channel {} out of range [0, 7]", channel);
            }
        }
        for (&relay, &weight) in &ctl.pwm_relays {
            if relay > 7 {
                anyhow::bail!("pwm relay {} out of range [0, 7]", relay);
            }
            if !(0.0..=1.0).contains(&weight) {
                anyhow::bail!("pwm relay {} weight {} outside [0, 1]", relay, weight);
            }
        }
        for &relay in &ctl.relays_on_when_running {
            if relay > 7 {
                anyhow::bail!("always-on relay {} out of range [0, 7]", relay);
            }
        }
        if !(0.0..=1.0).contains(&ctl.pid.setpoint_weight) {
            anyhow::bail!("setpoint_weight {} outside [0, 1]", ctl.pid.setpoint_weight);
        }
        if ctl.pid.derivative_filter_s < 0.0
            || ctl.pid.integrator_zone_c < 0.0
            || ctl.pid.integrator_leak_s < 0.0
        {
            anyhow::bail!("PID time constants and integrator zone must be >= 0");
        }
        if !(0.0..=180.0).contains(&ctl.door.closed_angle_deg)
            || !(0.0..=180.0).contains(&ctl.door.open_angle_deg)
        {
            anyhow::bail!("door angles must lie in [0, 180]");
        }
        if !(1.0..=360.0).contains(&ctl.door.max_speed_deg_per_s) {
            anyhow::bail!(
                "door max speed {} outside [1, 360] deg/s",
                ctl.door.max_speed_deg_per_s
            );
        }

        let hw = &config.hardware;
        if hw.thermocouple_channels == 0 || hw.thermocouple_channels > 8 {
            anyhow::bail!(
                "thermocouple_channels must be in [1, 8], got {}",
                hw.thermocouple_channels
            );
        }
        if hw.sensor_poll_ms == 0 {
            anyhow::bail!("sensor_poll_ms must be > 0");
        }

        if !(250..=10_000).contains(&config.telemetry.log_interval_ms) {
            anyhow::bail!(
                "telemetry log_interval_ms must be in [250, 10000], got {}",
                config.telemetry.log_interval_ms
            );
        }
        if config.telemetry.max_points == 0 {
            anyhow::bail!("telemetry max_points must be > 0");
        }

        Ok(())
    }
}
