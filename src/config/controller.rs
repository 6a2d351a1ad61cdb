// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Controller configuration
//!
//! Boot-time defaults for the regulation loop. Runtime changes made through
//! the controller setters are persisted in the settings store and take
//! precedence over these values on the next boot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Configuration of the regulation loop and its actuators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Control tick period in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Slow-PWM relay period in milliseconds.
    #[serde(default = "default_pwm_period_ms")]
    pub pwm_period_ms: u64,

    /// First-order input filter time constant in milliseconds.
    #[serde(default = "default_input_filter_ms")]
    pub input_filter_ms: f64,

    /// PID tuning applied at boot.
    #[serde(default)]
    pub pid: PidConfig,

    /// Thermocouple channels fused into the process value.
    #[serde(default = "default_input_channels")]
    pub input_channels: Vec<u8>,

    /// Relays driven by the slow PWM, with per-relay weight in [0, 1].
    #[serde(default = "default_pwm_relays")]
    pub pwm_relays: HashMap<u8, f64>,

    /// Relays closed whenever the controller is running (convection fan,
    /// chamber light, ...).
    #[serde(default = "default_relays_on_when_running")]
    pub relays_on_when_running: Vec<u8>,

    /// Vent door calibration.
    #[serde(default)]
    pub door: DoorConfig,
}

/// Boot-time PID tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    /// Heating gain bank (positive output authority).
    #[serde(default = "default_heating_gains")]
    pub heating: GainBankConfig,

    /// Cooling gain bank (negative output authority).
    #[serde(default = "default_cooling_gains")]
    pub cooling: GainBankConfig,

    /// Setpoint weight `b` in [0, 1].
    #[serde(default = "default_setpoint_weight")]
    pub setpoint_weight: f64,

    /// Derivative filter time constant in seconds; 0 disables filtering.
    #[serde(default)]
    pub derivative_filter_s: f64,

    /// Integrator zone in °C; 0 disables the gate.
    #[serde(default)]
    pub integrator_zone_c: f64,

    /// Integrator leak time constant in seconds; 0 disables the leak.
    #[serde(default)]
    pub integrator_leak_s: f64,
}

/// One gain bank.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GainBankConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// Vent door servo calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorConfig {
    /// Servo angle with the vent fully closed, degrees.
    #[serde(default)]
    pub closed_angle_deg: f64,

    /// Servo angle with the vent fully open, degrees.
    #[serde(default = "default_door_open_angle")]
    pub open_angle_deg: f64,

    /// Servo slew limit in degrees per second, within [1, 360].
    #[serde(default = "default_door_max_speed")]
    pub max_speed_deg_per_s: f64,
}

fn default_tick_interval_ms() -> u64 {
    250
}
fn default_pwm_period_ms() -> u64 {
    1000
}
fn default_input_filter_ms() -> f64 {
    100.0
}
fn default_input_channels() -> Vec<u8> {
    vec![0]
}
fn default_pwm_relays() -> HashMap<u8, f64> {
    HashMap::from([(0, 1.0), (1, 0.5)])
}
fn default_relays_on_when_running() -> Vec<u8> {
    vec![2]
}
fn default_heating_gains() -> GainBankConfig {
    GainBankConfig {
        kp: 4.0,
        ki: 0.05,
        kd: 20.0,
    }
}
fn default_cooling_gains() -> GainBankConfig {
    GainBankConfig {
        kp: 2.0,
        ki: 0.0,
        kd: 10.0,
    }
}
fn default_setpoint_weight() -> f64 {
    1.0
}
fn default_door_open_angle() -> f64 {
    90.0
}
fn default_door_max_speed() -> f64 {
    60.0
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            pwm_period_ms: default_pwm_period_ms(),
            input_filter_ms: default_input_filter_ms(),
            pid: PidConfig::default(),
            input_channels: default_input_channels(),
            pwm_relays: default_pwm_relays(),
            relays_on_when_running: default_relays_on_when_running(),
            door: DoorConfig::default(),
        }
    }
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            heating: default_heating_gains(),
            cooling: default_cooling_gains(),
            setpoint_weight: default_setpoint_weight(),
            derivative_filter_s: 0.0,
            integrator_zone_c: 0.0,
            integrator_leak_s: 0.0,
        }
    }
}

impl Default for DoorConfig {
    fn default() -> Self {
        Self {
            closed_angle_deg: 0.0,
            open_angle_deg: default_door_open_angle(),
            max_speed_deg_per_s: default_door_max_speed(),
        }
    }
}
