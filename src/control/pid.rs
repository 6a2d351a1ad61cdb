// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Dual-gain PID controller
//!
//! One regulator with two gain banks: positive outputs request heating
//! authority (relay PWM), negative outputs request cooling authority (vent
//! door). Beyond the textbook terms it implements:
//!
//! - setpoint weighting: the proportional term sees `b·sp − pv` while the
//!   integrator and the I-zone gate see the unweighted error;
//! - a band clamp that keeps the proportional term from pushing against the
//!   sign of the error when the weighted error disagrees with it;
//! - derivative on measurement with a first-order filter;
//! - an I-zone that freezes the integrator outside a configurable error band
//!   and an exponential leak that bleeds it toward zero;
//! - conditional integrator acceptance in cooling mode (a candidate is taken
//!   only when it shrinks the accumulator) and a back-solved anti-windup
//!   clamp so the stored integrator never exceeds what the output can carry.
//!
//! `calculate` must be called from a single logical task; the shared
//! [`Clock`] supplies timestamps so tests control `dt` exactly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::clock::Clock;
use super::error::{ControlError, ControlResult};

/// Default output authority, symmetric around zero.
pub const OUTPUT_MIN: f64 = -100.0;
pub const OUTPUT_MAX: f64 = 100.0;

/// One bank of PID gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }

    fn validate(&self) -> ControlResult<()> {
        for (name, value) in [("kp", self.kp), ("ki", self.ki), ("kd", self.kd)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ControlError::InvalidArgument(format!(
                    "{} must be finite and >= 0, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
        }
    }
}

/// Last computed terms, kept for telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PidTerms {
    /// Band-clamped proportional contribution.
    pub proportional: f64,
    /// Integral contribution actually applied (post anti-windup clamp).
    pub integral: f64,
    /// Filtered derivative contribution.
    pub derivative: f64,
    /// Clamped output.
    pub output: f64,
}

/// Dual-gain PID regulator.
pub struct PidController {
    clock: Arc<dyn Clock>,

    heating: PidGains,
    cooling: PidGains,
    output_min: f64,
    output_max: f64,

    /// Setpoint weight `b` in [0, 1]; proportional error is `b·sp − pv`.
    setpoint_weight: f64,
    /// Derivative filter time constant in seconds; 0 disables filtering.
    derivative_filter_s: f64,
    /// Integrator zone in °C; the integrator only moves while |e| is inside.
    /// 0 disables the gate.
    integrator_zone_c: f64,
    /// Integrator leak time constant in seconds; 0 disables the leak.
    integrator_leak_s: f64,

    integral: f64,
    d_filtered: f64,
    pv_prev: f64,
    last_time_us: u64,
    first_run: bool,

    last_terms: PidTerms,
}

/// Keep the proportional term on the side of the unweighted error.
///
/// With setpoint weighting the weighted error can flip sign relative to the
/// real error; the band clamp prevents the P term from actively fighting the
/// direction the controller needs to move.
fn clamp_to_band(value: f64, error: f64) -> f64 {
    if error > 0.0 {
        value.max(0.0)
    } else if error < 0.0 {
        value.min(0.0)
    } else {
        value
    }
}

impl PidController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            heating: PidGains::default(),
            cooling: PidGains::default(),
            output_min: OUTPUT_MIN,
            output_max: OUTPUT_MAX,
            setpoint_weight: 1.0,
            derivative_filter_s: 0.0,
            integrator_zone_c: 0.0,
            integrator_leak_s: 0.0,
            integral: 0.0,
            d_filtered: 0.0,
            pv_prev: 0.0,
            last_time_us: 0,
            first_run: true,
            last_terms: PidTerms::default(),
        }
    }

    /// Replace the heating gain bank.
    pub fn tune_heating(&mut self, gains: PidGains) -> ControlResult<()> {
        gains.validate()?;
        self.heating = gains;
        Ok(())
    }

    /// Replace the cooling gain bank.
    pub fn tune_cooling(&mut self, gains: PidGains) -> ControlResult<()> {
        gains.validate()?;
        self.cooling = gains;
        Ok(())
    }

    /// Set the setpoint weight `b`; must lie in [0, 1].
    pub fn set_setpoint_weight(&mut self, weight: f64) -> ControlResult<()> {
        if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
            return Err(ControlError::InvalidArgument(format!(
                "setpoint weight must be in [0,1], got {}",
                weight
            )));
        }
        self.setpoint_weight = weight;
        Ok(())
    }

    /// Set the derivative filter time constant in seconds; 0 disables it.
    pub fn set_derivative_filter_time(&mut self, seconds: f64) -> ControlResult<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ControlError::InvalidArgument(format!(
                "derivative filter time must be >= 0 s, got {}",
                seconds
            )));
        }
        self.derivative_filter_s = seconds;
        Ok(())
    }

    /// Set the integrator zone in °C; 0 disables the gate.
    pub fn set_integrator_zone(&mut self, zone_c: f64) -> ControlResult<()> {
        if !zone_c.is_finite() || zone_c < 0.0 {
            return Err(ControlError::InvalidArgument(format!(
                "integrator zone must be >= 0 °C, got {}",
                zone_c
            )));
        }
        self.integrator_zone_c = zone_c;
        Ok(())
    }

    /// Set the integrator leak time constant in seconds; 0 disables the leak.
    pub fn set_integrator_leak_time(&mut self, seconds: f64) -> ControlResult<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ControlError::InvalidArgument(format!(
                "integrator leak time must be >= 0 s, got {}",
                seconds
            )));
        }
        self.integrator_leak_s = seconds;
        Ok(())
    }

    pub fn heating_gains(&self) -> PidGains {
        self.heating
    }

    pub fn cooling_gains(&self) -> PidGains {
        self.cooling
    }

    pub fn setpoint_weight(&self) -> f64 {
        self.setpoint_weight
    }

    pub fn derivative_filter_time(&self) -> f64 {
        self.derivative_filter_s
    }

    pub fn integrator_zone(&self) -> f64 {
        self.integrator_zone_c
    }

    pub fn integrator_leak_time(&self) -> f64 {
        self.integrator_leak_s
    }

    /// Last P/I/D/output snapshot.
    pub fn last_terms(&self) -> PidTerms {
        self.last_terms
    }

    /// Clear all runtime state. The next `calculate` re-seeds the derivative
    /// history and emits a pure proportional output.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.d_filtered = 0.0;
        self.pv_prev = 0.0;
        self.last_time_us = 0;
        self.first_run = true;
        self.last_terms = PidTerms::default();
    }

    /// Run one regulation step and return the signed output in
    /// [`OUTPUT_MIN`, `OUTPUT_MAX`].
    pub fn calculate(&mut self, setpoint: f64, pv: f64) -> f64 {
        let now_us = self.clock.now_micros();
        let first = self.first_run;

        // dt floors at one microsecond; the first call after construction or
        // reset uses exactly that floor and seeds the derivative history.
        let dt = if first {
            1e-6
        } else {
            (now_us.saturating_sub(self.last_time_us)).max(1) as f64 * 1e-6
        };
        if first {
            self.pv_prev = pv;
        }

        let error = setpoint - pv;
        let weighted_error = self.setpoint_weight * setpoint - pv;

        // Derivative on measurement, sign-flipped, first-order filtered.
        if !first {
            let d_raw = -(pv - self.pv_prev) / dt;
            let alpha = if self.derivative_filter_s > 0.0 {
                dt / (self.derivative_filter_s + dt)
            } else {
                1.0
            };
            self.d_filtered = alpha * d_raw + (1.0 - alpha) * self.d_filtered;
        }

        // Both banks are evaluated; the cooling pair decides the mode.
        let p_heating = clamp_to_band(self.heating.kp * weighted_error, error);
        let d_heating = self.heating.kd * self.d_filtered;
        let p_cooling = clamp_to_band(self.cooling.kp * weighted_error, error);
        let d_cooling = self.cooling.kd * self.d_filtered;

        let cooling_mode = (p_cooling + d_cooling) < 0.0;
        let (ki_active, p, d) = if cooling_mode {
            (self.cooling.ki, p_cooling, d_cooling)
        } else {
            (self.heating.ki, p_heating, d_heating)
        };

        if !first {
            if self.integrator_leak_s > 0.0 {
                self.integral *= (-dt / self.integrator_leak_s).exp();
            }

            let in_zone =
                self.integrator_zone_c <= 0.0 || error.abs() <= self.integrator_zone_c;
            if ki_active > 0.0 && in_zone {
                let candidate = self.integral + error * dt;
                if cooling_mode {
                    // Cooling only accepts updates that shrink the stored
                    // accumulator; growth while venting is windup.
                    if candidate.abs() < self.integral.abs() {
                        self.integral = candidate;
                    }
                } else {
                    self.integral = candidate;
                }
            }
        }

        // Clamp the integral contribution to the headroom left by P + D and
        // back-solve so the stored accumulator matches what was applied. The
        // first run emits the P term alone.
        let i_term = if first {
            0.0
        } else if ki_active > 0.0 {
            let headroom_lo = self.output_min - (p + d);
            let headroom_hi = self.output_max - (p + d);
            let clamped = (ki_active * self.integral).clamp(headroom_lo, headroom_hi);
            self.integral = clamped / ki_active;
            clamped
        } else {
            0.0
        };

        let output = (p + d + i_term).clamp(self.output_min, self.output_max);

        self.last_terms = PidTerms {
            proportional: p,
            integral: i_term,
            derivative: d,
            output,
        };
        self.pv_prev = pv;
        self.last_time_us = now_us;
        self.first_run = false;

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::clock::ManualClock;

    fn pid_with_clock() -> (PidController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let pid = PidController::new(clock.clone());
        (pid, clock)
    }

    #[test]
    fn test_p_only_step_response() {
        let (mut pid, clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(10.0, 0.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();

        // First call clamps 10 * 25 = 250 to the output ceiling.
        assert_eq!(pid.calculate(50.0, 25.0), 100.0);

        clock.advance_secs(1.0);
        assert_eq!(pid.calculate(50.0, 45.0), 50.0);
    }

    #[test]
    fn test_setpoint_weight_band_clamp() {
        let (mut pid, _clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(2.0, 0.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();
        pid.set_setpoint_weight(0.5).unwrap();

        // e = 100, e_w = 50, Kp·e_w = 100, already error-aligned.
        assert_eq!(pid.calculate(100.0, 0.0), 100.0);

        let (mut pid, _clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(2.0, 0.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();
        pid.set_setpoint_weight(0.0).unwrap();

        // e_w = 0 so the P term is zero; the band keeps it >= 0.
        assert_eq!(pid.calculate(100.0, 0.0), 0.0);
    }

    #[test]
    fn test_band_clamp_blocks_sign_fight() {
        // b = 0.5, sp = 100, pv = 80: e = 20 > 0 but e_w = -30 would drive
        // the P term negative. The band clamp floors it at zero.
        let (mut pid, _clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(2.0, 0.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();
        pid.set_setpoint_weight(0.5).unwrap();

        assert_eq!(pid.calculate(100.0, 80.0), 0.0);
    }

    #[test]
    fn test_first_run_after_reset_is_pure_proportional() {
        let (mut pid, clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(2.0, 1.0, 5.0)).unwrap();
        pid.tune_cooling(PidGains::new(1.0, 0.5, 2.0)).unwrap();

        // Accumulate some state.
        pid.calculate(100.0, 20.0);
        clock.advance_secs(1.0);
        pid.calculate(100.0, 40.0);

        pid.reset();
        clock.advance_secs(1.0);
        let out = pid.calculate(50.0, 40.0);
        let terms = pid.last_terms();

        // Pure P: clamp(Kp_h * (b·sp − pv)) with no I and no D.
        assert_eq!(out, (2.0_f64 * (50.0 - 40.0)).clamp(-100.0, 100.0));
        assert_eq!(terms.integral, 0.0);
        assert_eq!(terms.derivative, 0.0);
    }

    #[test]
    fn test_output_always_within_bounds() {
        let (mut pid, clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(50.0, 10.0, 5.0)).unwrap();
        pid.tune_cooling(PidGains::new(50.0, 10.0, 5.0)).unwrap();
        pid.set_derivative_filter_time(0.5).unwrap();

        let mut pv = 0.0;
        for step in 0..200 {
            let setpoint = if step % 2 == 0 { 300.0 } else { -50.0 };
            let out = pid.calculate(setpoint, pv);
            assert!((-100.0..=100.0).contains(&out), "out of bounds: {}", out);
            clock.advance_secs(0.25);
            pv += out * 0.1;
        }
    }

    #[test]
    fn test_integrator_never_exceeds_headroom() {
        let (mut pid, clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(1.0, 2.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();

        pid.calculate(200.0, 0.0);
        for _ in 0..100 {
            clock.advance_secs(1.0);
            pid.calculate(200.0, 0.0);
            let terms = pid.last_terms();
            let p_d = terms.proportional + terms.derivative;
            let cap = (100.0 - p_d).abs().max((-100.0 - p_d).abs());
            assert!(
                terms.integral.abs() <= cap + 1e-9,
                "integral {} beyond deliverable headroom {}",
                terms.integral,
                cap
            );
        }
    }

    #[test]
    fn test_cooling_mode_integrator_monotone_decay() {
        let (mut pid, clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(0.0, 0.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(1.0, 0.5, 0.0)).unwrap();

        // Seed a heating-side accumulator first.
        pid.tune_heating(PidGains::new(1.0, 1.0, 0.0)).unwrap();
        pid.calculate(100.0, 50.0);
        clock.advance_secs(2.0);
        pid.calculate(100.0, 50.0);

        // Now drive cooling with growing overshoot; |I| must never grow.
        let mut prev_abs = f64::INFINITY;
        for step in 0..20 {
            clock.advance_secs(1.0);
            let pv = 110.0 + step as f64 * 5.0;
            pid.calculate(100.0, pv);
            let i_abs = pid.last_terms().integral.abs();
            assert!(
                i_abs <= prev_abs + 1e-9,
                "cooling-mode |I| grew: {} -> {}",
                prev_abs,
                i_abs
            );
            prev_abs = i_abs;
        }
    }

    #[test]
    fn test_integrator_zone_freezes_outside_band() {
        let (mut pid, clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(0.1, 1.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();
        pid.set_integrator_zone(5.0).unwrap();

        pid.calculate(100.0, 0.0);
        clock.advance_secs(1.0);
        // |e| = 100 > 5: frozen.
        pid.calculate(100.0, 0.0);
        assert_eq!(pid.last_terms().integral, 0.0);

        clock.advance_secs(1.0);
        // |e| = 3 <= 5: accumulates.
        pid.calculate(100.0, 97.0);
        assert!(pid.last_terms().integral > 0.0);
    }

    #[test]
    fn test_integrator_leak_decays_accumulator() {
        let (mut pid, clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(0.0, 1.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();

        pid.calculate(10.0, 0.0);
        clock.advance_secs(1.0);
        pid.calculate(10.0, 0.0);
        let before = pid.last_terms().integral;
        assert!(before > 0.0);

        pid.set_integrator_leak_time(2.0).unwrap();
        clock.advance_secs(2.0);
        // At the setpoint there is no new accumulation, only the leak.
        pid.calculate(0.0, 0.0);
        let after = pid.last_terms().integral;
        assert!(after < before);
        assert!((after - before * (-1.0f64).exp()).abs() < before * 0.01);
    }

    #[test]
    fn test_derivative_filter_smooths_measurement_steps() {
        let (mut unfiltered, clock_a) = pid_with_clock();
        unfiltered.tune_heating(PidGains::new(0.0, 0.0, 1.0)).unwrap();
        unfiltered.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();

        let (mut filtered, clock_b) = pid_with_clock();
        filtered.tune_heating(PidGains::new(0.0, 0.0, 1.0)).unwrap();
        filtered.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();
        filtered.set_derivative_filter_time(10.0).unwrap();

        unfiltered.calculate(100.0, 50.0);
        filtered.calculate(100.0, 50.0);
        clock_a.advance_secs(1.0);
        clock_b.advance_secs(1.0);

        // pv drops by 10 in 1 s: raw derivative term is +10.
        let raw = unfiltered.calculate(100.0, 40.0);
        let smooth = filtered.calculate(100.0, 40.0);
        assert!((raw - 10.0).abs() < 1e-9);
        assert!(smooth < raw);
        assert!(smooth > 0.0);
    }

    #[test]
    fn test_dt_floor_survives_equal_timestamps() {
        let (mut pid, _clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(1.0, 0.0, 1.0)).unwrap();
        pid.tune_cooling(PidGains::new(0.0, 0.0, 0.0)).unwrap();

        pid.calculate(10.0, 0.0);
        // Clock not advanced: dt clamps to 1 µs and the output stays finite.
        let out = pid.calculate(10.0, 0.0);
        assert!(out.is_finite());
        assert!((-100.0..=100.0).contains(&out));
    }

    #[test]
    fn test_tuning_setters_validate_inputs() {
        let (mut pid, _clock) = pid_with_clock();
        assert!(pid.tune_heating(PidGains::new(-1.0, 0.0, 0.0)).is_err());
        assert!(pid.tune_heating(PidGains::new(f64::NAN, 0.0, 0.0)).is_err());
        assert!(pid.set_setpoint_weight(1.5).is_err());
        assert!(pid.set_setpoint_weight(-0.1).is_err());
        assert!(pid.set_derivative_filter_time(-1.0).is_err());
        assert!(pid.set_integrator_zone(-2.0).is_err());
        assert!(pid.set_integrator_leak_time(f64::INFINITY).is_err());

        // Valid boundary values pass.
        assert!(pid.set_setpoint_weight(0.0).is_ok());
        assert!(pid.set_setpoint_weight(1.0).is_ok());
        assert!(pid.set_derivative_filter_time(0.0).is_ok());
    }

    #[test]
    fn test_cooling_output_is_negative_on_overshoot() {
        let (mut pid, clock) = pid_with_clock();
        pid.tune_heating(PidGains::new(5.0, 0.0, 0.0)).unwrap();
        pid.tune_cooling(PidGains::new(3.0, 0.0, 0.0)).unwrap();

        pid.calculate(100.0, 90.0);
        clock.advance_secs(1.0);
        let out = pid.calculate(100.0, 150.0);
        assert!(out < 0.0);
        assert_eq!(out, (3.0_f64 * (100.0 - 150.0)).clamp(-100.0, 100.0));
    }
}
