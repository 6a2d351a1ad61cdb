// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Hardware abstraction for the oven
//!
//! The control core talks to relays, the vent servo and the thermocouple
//! bank exclusively through [`HardwareDriver`]. All operations are
//! synchronous and idempotent; thermocouple failures are reported in-band
//! with [`THERMOCOUPLE_ERROR_VALUE`] so the sensor path stays allocation
//! free. The only in-tree backend is the mock oven used for development and
//! tests; real boards are out of scope for this crate.

pub mod mock;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{HardwareConfig, HardwareDriverKind};
use crate::control::error::ControlResult;

pub use mock::MockOvenDriver;

/// Sentinel returned by `read_thermocouple` when a channel fails.
pub const THERMOCOUPLE_ERROR_VALUE: f64 = -3000.0;

/// Relay indices run 0..RELAY_COUNT across masks, weights and telemetry.
pub const RELAY_COUNT: usize = 8;

/// Servo travel limits in degrees.
pub const SERVO_MIN_ANGLE: f64 = 0.0;
pub const SERVO_MAX_ANGLE: f64 = 180.0;

/// Synchronous, idempotent oven I/O.
pub trait HardwareDriver: Send + Sync {
    /// Temperature of `channel` in °C, or [`THERMOCOUPLE_ERROR_VALUE`] on
    /// failure.
    fn read_thermocouple(&self, channel: usize) -> f64;

    /// Close (`true`) or open (`false`) relay `index`.
    fn set_relay(&self, index: usize, closed: bool) -> ControlResult<()>;

    /// Last commanded state of relay `index`.
    fn relay_state(&self, index: usize) -> bool;

    /// All relay states packed as a bitmask, bit n = relay n.
    fn relay_bitmask(&self) -> u8 {
        let mut mask = 0u8;
        for index in 0..RELAY_COUNT {
            if self.relay_state(index) {
                mask |= 1 << index;
            }
        }
        mask
    }

    /// Drive the vent servo to `angle_deg` in [0, 180].
    fn set_servo_angle(&self, angle_deg: f64) -> ControlResult<()>;

    /// Last commanded servo angle in degrees.
    fn servo_angle(&self) -> f64;
}

/// Build the hardware driver selected by the configuration.
pub fn create_hardware_driver(config: &HardwareConfig) -> Result<Arc<dyn HardwareDriver>> {
    match config.driver {
        HardwareDriverKind::Mock => Ok(Arc::new(MockOvenDriver::new(config))),
    }
}
