// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Shared last-known thermocouple temperatures
//!
//! Single writer (the daemon's sensor reader task), many readers (controller
//! tick, telemetry). Values are stored as `f64` bit patterns in atomics, so
//! readers never block the reader task and may observe a value one refresh
//! old, which is acceptable: the control tick period exceeds the sensor
//! refresh period.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::hardware::THERMOCOUPLE_ERROR_VALUE;

/// Number of thermocouple channels exposed to the controller.
pub const SENSOR_CHANNELS: usize = 8;

/// Lock-free bank of last-known channel temperatures in °C.
pub struct SensorBank {
    values: [AtomicU64; SENSOR_CHANNELS],
}

impl SensorBank {
    /// All channels start at the error sentinel until the reader task has
    /// published a first value.
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(THERMOCOUPLE_ERROR_VALUE.to_bits())),
        }
    }

    /// Publish a new reading for `channel`. Out-of-range channels are ignored.
    pub fn store(&self, channel: usize, value_c: f64) {
        if let Some(cell) = self.values.get(channel) {
            cell.store(value_c.to_bits(), Ordering::Release);
        }
    }

    /// Last-known value for `channel`; the error sentinel for out-of-range
    /// channels or channels that never produced a reading.
    pub fn get(&self, channel: usize) -> f64 {
        self.values
            .get(channel)
            .map(|cell| f64::from_bits(cell.load(Ordering::Acquire)))
            .unwrap_or(THERMOCOUPLE_ERROR_VALUE)
    }

    /// Copy of all channels, for telemetry.
    pub fn snapshot(&self) -> [f64; SENSOR_CHANNELS] {
        std::array::from_fn(|channel| self.get(channel))
    }
}

impl Default for SensorBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_error_sentinel() {
        let bank = SensorBank::new();
        for channel in 0..SENSOR_CHANNELS {
            assert_eq!(bank.get(channel), THERMOCOUPLE_ERROR_VALUE);
        }
    }

    #[test]
    fn test_store_and_get_roundtrip() {
        let bank = SensorBank::new();
        bank.store(0, 182.5);
        bank.store(7, -3.25);
        assert_eq!(bank.get(0), 182.5);
        assert_eq!(bank.get(7), -3.25);
        assert_eq!(bank.get(1), THERMOCOUPLE_ERROR_VALUE);
    }

    #[test]
    fn test_out_of_range_channels_are_safe() {
        let bank = SensorBank::new();
        bank.store(SENSOR_CHANNELS, 100.0);
        assert_eq!(bank.get(SENSOR_CHANNELS), THERMOCOUPLE_ERROR_VALUE);
        assert_eq!(bank.get(usize::MAX), THERMOCOUPLE_ERROR_VALUE);
    }

    #[test]
    fn test_snapshot_reflects_stores() {
        let bank = SensorBank::new();
        for channel in 0..4 {
            bank.store(channel, 20.0 + channel as f64);
        }
        let snapshot = bank.snapshot();
        assert_eq!(snapshot[2], 22.0);
        assert_eq!(snapshot[5], THERMOCOUPLE_ERROR_VALUE);
    }
}
