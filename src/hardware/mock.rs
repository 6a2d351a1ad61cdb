// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Mock oven driver with a first-order thermal plant
//!
//! Simulates the chamber the controller regulates: closed heating relays add
//! heat, the chamber loses heat to ambient by convection, and the vent door
//! (servo angle) scales the loss up. The plant is stepped lazily on every
//! thermocouple read so the simulated temperature always reflects the
//! actuator state at the time of the reading.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

use crate::config::HardwareConfig;
use crate::control::error::{ControlError, ControlResult};

use super::{
    HardwareDriver, RELAY_COUNT, SERVO_MAX_ANGLE, SERVO_MIN_ANGLE, THERMOCOUPLE_ERROR_VALUE,
};

struct PlantState {
    temperature_c: f64,
    relays: [bool; RELAY_COUNT],
    servo_angle_deg: f64,
    last_update: Instant,
    last_log: Instant,
}

/// Simulated oven implementing [`HardwareDriver`].
pub struct MockOvenDriver {
    state: Mutex<PlantState>,
    /// Channels that report a temperature; higher channels return the
    /// error sentinel like disconnected probes would.
    thermocouple_channels: usize,
    /// Relays that feed heating elements in the simulation.
    heater_relays: Vec<usize>,
    ambient_c: f64,
    /// Chamber heating rate per closed heater relay at full authority, °C/s.
    heater_rate_c_per_s: f64,
    /// Convective loss coefficient toward ambient, 1/s.
    loss_coefficient_per_s: f64,
    /// Loss multiplier added at a fully open vent door.
    door_loss_boost: f64,
    /// Uniform measurement noise amplitude, °C.
    sensor_noise_c: f64,
}

impl MockOvenDriver {
    pub fn new(config: &HardwareConfig) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(PlantState {
                temperature_c: config.mock.ambient_c,
                relays: [false; RELAY_COUNT],
                servo_angle_deg: 0.0,
                last_update: now,
                last_log: now,
            }),
            thermocouple_channels: config.thermocouple_channels.min(8) as usize,
            heater_relays: config.mock.heater_relays.clone(),
            ambient_c: config.mock.ambient_c,
            heater_rate_c_per_s: config.mock.heater_rate_c_per_s,
            loss_coefficient_per_s: config.mock.loss_coefficient_per_s,
            door_loss_boost: config.mock.door_loss_boost,
            sensor_noise_c: config.mock.sensor_noise_c,
        }
    }

    /// Advance the plant to "now".
    fn step_plant(&self, state: &mut PlantState) {
        let now = Instant::now();
        let dt = now.duration_since(state.last_update).as_secs_f64();
        state.last_update = now;

        // Sanity window on the time step, as with any lazily stepped model.
        if dt <= 0.0 || dt > 10.0 {
            return;
        }

        let closed_heaters = self
            .heater_relays
            .iter()
            .filter(|&&index| index < RELAY_COUNT && state.relays[index])
            .count() as f64;

        let heat_in = closed_heaters * self.heater_rate_c_per_s;

        let door_fraction = (state.servo_angle_deg / SERVO_MAX_ANGLE).clamp(0.0, 1.0);
        let loss = self.loss_coefficient_per_s
            * (state.temperature_c - self.ambient_c)
            * (1.0 + self.door_loss_boost * door_fraction);

        state.temperature_c += (heat_in - loss) * dt;

        if now.duration_since(state.last_log) >= Duration::from_secs(60) {
            info!(
                "mock oven: {:.2} °C, {} heater relay(s) closed, door {:.0}%",
                state.temperature_c,
                closed_heaters as usize,
                door_fraction * 100.0
            );
            state.last_log = now;
        }
    }

    /// Current simulated chamber temperature, without sensor noise.
    pub fn chamber_temperature(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        self.step_plant(&mut state);
        state.temperature_c
    }

    /// Override the simulated chamber temperature (test hook).
    pub fn set_chamber_temperature(&self, temperature_c: f64) {
        let mut state = self.state.lock().unwrap();
        state.temperature_c = temperature_c;
        state.last_update = Instant::now();
    }
}

impl HardwareDriver for MockOvenDriver {
    fn read_thermocouple(&self, channel: usize) -> f64 {
        if channel >= self.thermocouple_channels {
            return THERMOCOUPLE_ERROR_VALUE;
        }

        let mut state = self.state.lock().unwrap();
        self.step_plant(&mut state);

        let noise = if self.sensor_noise_c > 0.0 {
            rand::rng().random_range(-self.sensor_noise_c..=self.sensor_noise_c)
        } else {
            0.0
        };
        state.temperature_c + noise
    }

    fn set_relay(&self, index: usize, closed: bool) -> ControlResult<()> {
        if index >= RELAY_COUNT {
            return Err(ControlError::InvalidArgument(format!(
                "relay index {} out of range",
                index
            )));
        }
        let mut state = self.state.lock().unwrap();
        self.step_plant(&mut state);
        if state.relays[index] != closed {
            debug!("mock relay {} -> {}", index, if closed { "ON" } else { "OFF" });
        }
        state.relays[index] = closed;
        Ok(())
    }

    fn relay_state(&self, index: usize) -> bool {
        let state = self.state.lock().unwrap();
        index < RELAY_COUNT && state.relays[index]
    }

    fn set_servo_angle(&self, angle_deg: f64) -> ControlResult<()> {
        if !angle_deg.is_finite() || !(SERVO_MIN_ANGLE..=SERVO_MAX_ANGLE).contains(&angle_deg) {
            return Err(ControlError::InvalidArgument(format!(
                "servo angle {} outside [0,180]",
                angle_deg
            )));
        }
        let mut state = self.state.lock().unwrap();
        self.step_plant(&mut state);
        state.servo_angle_deg = angle_deg;
        Ok(())
    }

    fn servo_angle(&self) -> f64 {
        self.state.lock().unwrap().servo_angle_deg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HardwareConfig;

    fn quiet_driver() -> MockOvenDriver {
        let mut config = HardwareConfig::default();
        config.mock.sensor_noise_c = 0.0;
        MockOvenDriver::new(&config)
    }

    #[test]
    fn test_reads_start_at_ambient() {
        let driver = quiet_driver();
        let reading = driver.read_thermocouple(0);
        assert!((reading - HardwareConfig::default().mock.ambient_c).abs() < 0.5);
    }

    #[test]
    fn test_unpopulated_channels_return_sentinel() {
        let driver = quiet_driver();
        assert_eq!(driver.read_thermocouple(7), THERMOCOUPLE_ERROR_VALUE);
        assert_eq!(driver.read_thermocouple(100), THERMOCOUPLE_ERROR_VALUE);
    }

    #[test]
    fn test_relay_roundtrip_and_bitmask() {
        let driver = quiet_driver();
        driver.set_relay(0, true).unwrap();
        driver.set_relay(2, true).unwrap();
        assert!(driver.relay_state(0));
        assert!(!driver.relay_state(1));
        assert_eq!(driver.relay_bitmask(), 0b0000_0101);
        assert!(driver.set_relay(RELAY_COUNT, true).is_err());
    }

    #[test]
    fn test_servo_angle_validation() {
        let driver = quiet_driver();
        driver.set_servo_angle(90.0).unwrap();
        assert_eq!(driver.servo_angle(), 90.0);
        assert!(driver.set_servo_angle(-1.0).is_err());
        assert!(driver.set_servo_angle(180.1).is_err());
        assert!(driver.set_servo_angle(f64::NAN).is_err());
    }

    #[test]
    fn test_heater_relay_warms_the_chamber() {
        let driver = quiet_driver();
        driver.set_relay(0, true).unwrap();

        // Step the plant by faking an elapsed second.
        {
            let mut state = driver.state.lock().unwrap();
            state.last_update = Instant::now() - Duration::from_secs(1);
        }
        let before = HardwareConfig::default().mock.ambient_c;
        let after = driver.chamber_temperature();
        assert!(after > before, "expected warming, {} -> {}", before, after);
    }

    #[test]
    fn test_open_door_cools_faster() {
        let driver = quiet_driver();
        driver.set_chamber_temperature(200.0);
        {
            let mut state = driver.state.lock().unwrap();
            state.last_update = Instant::now() - Duration::from_secs(1);
        }
        let closed_door = driver.chamber_temperature();

        driver.set_chamber_temperature(200.0);
        driver.set_servo_angle(180.0).unwrap();
        {
            let mut state = driver.state.lock().unwrap();
            state.last_update = Instant::now() - Duration::from_secs(1);
        }
        let open_door = driver.chamber_temperature();

        assert!(open_door < closed_door);
    }
}
