// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Hardware configuration

use serde::{Deserialize, Serialize};

/// Hardware driver selection and parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Driver backend.
    #[serde(rename = "type", default)]
    pub driver: HardwareDriverKind,

    /// Number of populated thermocouple channels (1..=8).
    #[serde(default = "default_thermocouple_channels")]
    pub thermocouple_channels: u8,

    /// Thermocouple refresh period of the sensor reader task, milliseconds.
    #[serde(default = "default_sensor_poll_ms")]
    pub sensor_poll_ms: u64,

    /// Parameters of the simulated oven plant.
    #[serde(default)]
    pub mock: MockPlantConfig,
}

/// Hardware backend enumeration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HardwareDriverKind {
    /// Simulated oven plant for development and testing.
    Mock,
}

/// Simulated oven plant parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockPlantConfig {
    /// Ambient temperature in °C.
    #[serde(default = "default_ambient_c")]
    pub ambient_c: f64,

    /// Relays treated as heating elements by the simulation.
    #[serde(default = "default_heater_relays")]
    pub heater_relays: Vec<usize>,

    /// Heating rate per closed heater relay, °C/s.
    #[serde(default = "default_heater_rate")]
    pub heater_rate_c_per_s: f64,

    /// Convective loss coefficient toward ambient, 1/s.
    #[serde(default = "default_loss_coefficient")]
    pub loss_coefficient_per_s: f64,

    /// Loss multiplier added with the vent door fully open.
    #[serde(default = "default_door_loss_boost")]
    pub door_loss_boost: f64,

    /// Uniform sensor noise amplitude in °C.
    #[serde(default = "default_sensor_noise")]
    pub sensor_noise_c: f64,
}

fn default_thermocouple_channels() -> u8 {
    4
}
fn default_sensor_poll_ms() -> u64 {
    220
}
fn default_ambient_c() -> f64 {
    24.0
}
fn default_heater_relays() -> Vec<usize> {
    vec![0, 1]
}
fn default_heater_rate() -> f64 {
    3.5
}
fn default_loss_coefficient() -> f64 {
    0.012
}
fn default_door_loss_boost() -> f64 {
    4.0
}
fn default_sensor_noise() -> f64 {
    0.2
}

impl Default for HardwareDriverKind {
    fn default() -> Self {
        HardwareDriverKind::Mock
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            driver: HardwareDriverKind::default(),
            thermocouple_channels: default_thermocouple_channels(),
            sensor_poll_ms: default_sensor_poll_ms(),
            mock: MockPlantConfig::default(),
        }
    }
}

impl Default for MockPlantConfig {
    fn default() -> Self {
        Self {
            ambient_c: default_ambient_c(),
            heater_relays: default_heater_relays(),
            heater_rate_c_per_s: default_heater_rate(),
            loss_coefficient_per_s: default_loss_coefficient(),
            door_loss_boost: default_door_loss_boost(),
            sensor_noise_c: default_sensor_noise(),
        }
    }
}
