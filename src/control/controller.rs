// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Tick orchestrator and actuator dispatcher
//!
//! The controller owns the PID, the slow PWM and the actuator policy. Each
//! tick it fuses the enabled thermocouple channels into a low-pass filtered
//! process value, evaluates the alarm conditions, and — while running —
//! feeds the PID output to the actuators: positive output becomes relay PWM
//! duty with per-relay cycle-skip weighting, negative output becomes a
//! temperature-compensated vent door opening, zero idles both.
//!
//! All mutable state sits behind one mutex. Long operations (hardware
//! writes, PWM start/stop) copy the fields they need and release the lock
//! first; the PWM edge callbacks re-enter through [`Controller::pwm_relays_on_edge`]
//! and take the lock briefly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::hardware::{HardwareDriver, RELAY_COUNT, SERVO_MAX_ANGLE, THERMOCOUPLE_ERROR_VALUE};
use crate::settings::{
    self, SettingsStore, KEY_DERIVATIVE_FILTER, KEY_DOOR_CLOSED_DEG, KEY_DOOR_OPEN_DEG,
    KEY_DOOR_SPEED, KEY_INPUTS_MASK, KEY_INPUT_FILTER_MS, KEY_INTEGRATOR_LEAK,
    KEY_INTEGRATOR_ZONE, KEY_PWM_RELAY_MASK, KEY_RELAYS_ON_MASK, KEY_SETPOINT_WEIGHT,
};

use super::clock::Clock;
use super::error::{ControlError, ControlResult};
use super::pid::{PidController, PidGains, PidTerms};
use super::sensor::SensorBank;
use super::slow_pwm::{PwmSink, SlowPwm};

/// Setpoint bounds in °C.
pub const MIN_SETPOINT_C: f64 = 0.0;
pub const MAX_SETPOINT_C: f64 = 300.0;

/// Process-value alarm band in °C; readings outside it trip the alarm.
pub const MIN_PROCESS_VALUE_C: f64 = -100.0;
pub const MAX_PROCESS_VALUE_C: f64 = 300.0;

/// Assumed room temperature for the door-cooling model, °C.
const ROOM_TEMPERATURE_C: f64 = 24.0;
/// Door cooling effectiveness at room temperature.
const MIN_DOOR_COOLING_EFFECTIVENESS: f64 = 0.45;
/// Exponent of the door opening nonlinearity.
const DOOR_COOLING_NONLINEARITY: f64 = 3.0;

/// Behavioral states; rendered as strings for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    SteadyState,
    Alarming,
    SensorError,
}

impl RunState {
    fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::SteadyState => "Steady State",
            RunState::Alarming => "Alarming",
            RunState::SensorError => "Sensor Error",
        }
    }
}

struct ControllerState {
    running: bool,
    state: RunState,
    alarming: bool,
    door_open: bool,
    setpoint_locked_by_profile: bool,

    setpoint_c: f64,
    process_value_c: f64,
    filtered_pv_c: f64,
    has_filtered_pv: bool,
    pid_output: f64,

    input_filter_ms: f64,
    input_channels: Vec<usize>,
    pwm_relays: HashMap<usize, f64>,
    pwm_phase: HashMap<usize, f64>,
    relays_on_when_running: Vec<usize>,

    door_closed_deg: f64,
    door_open_deg: f64,
    door_max_speed_deg_per_s: f64,
    door_preview_active: bool,
    door_preview_deg: f64,
}

/// Telemetry snapshot of the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub state: String,
    pub running: bool,
    pub alarming: bool,
    pub door_open: bool,
    pub setpoint_locked_by_profile: bool,
    pub setpoint_c: f64,
    pub process_value_c: f64,
    pub pid_output: f64,
    #[serde(flatten)]
    pub terms: PidTerms,
}

/// PWM edge callbacks routed back into the controller.
struct RelayEdgeSink {
    controller: Weak<Controller>,
}

impl PwmSink for RelayEdgeSink {
    fn on_high(&self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.pwm_relays_on_edge();
        }
    }

    fn on_low(&self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.pwm_relays_off_edge();
        }
    }
}

/// The reflow chamber controller.
pub struct Controller {
    inner: Mutex<ControllerState>,
    pid: Mutex<PidController>,
    pwm: SlowPwm,
    hardware: Arc<dyn HardwareDriver>,
    sensors: Arc<SensorBank>,
    settings: Arc<SettingsStore>,
    tick_interval_ms: f64,
}

fn mask_to_indices(mask: u64) -> Vec<usize> {
    (0..RELAY_COUNT).filter(|&i| mask & (1 << i) != 0).collect()
}

fn indices_to_mask(indices: &[usize]) -> u64 {
    indices
        .iter()
        .filter(|&&i| i < RELAY_COUNT)
        .fold(0u64, |mask, &i| mask | (1 << i))
}

impl Controller {
    /// Build the controller from boot configuration, with any persisted
    /// settings taking precedence over the configured defaults.
    pub fn new(
        config: &ControllerConfig,
        hardware: Arc<dyn HardwareDriver>,
        sensors: Arc<SensorBank>,
        settings: Arc<SettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let mut pid = PidController::new(clock);
        let pid_cfg = &config.pid;
        let heating = PidGains::new(
            settings.f64_or(settings::KEY_KP_HEAT, pid_cfg.heating.kp),
            settings.f64_or(settings::KEY_KI_HEAT, pid_cfg.heating.ki),
            settings.f64_or(settings::KEY_KD_HEAT, pid_cfg.heating.kd),
        );
        let cooling = PidGains::new(
            settings.f64_or(settings::KEY_KP_COOL, pid_cfg.cooling.kp),
            settings.f64_or(settings::KEY_KI_COOL, pid_cfg.cooling.ki),
            settings.f64_or(settings::KEY_KD_COOL, pid_cfg.cooling.kd),
        );
        if let Err(err) = pid.tune_heating(heating) {
            warn!("stored heating gains rejected, keeping defaults: {}", err);
        }
        if let Err(err) = pid.tune_cooling(cooling) {
            warn!("stored cooling gains rejected, keeping defaults: {}", err);
        }
        let _ = pid.set_setpoint_weight(
            settings
                .f64_or(KEY_SETPOINT_WEIGHT, pid_cfg.setpoint_weight)
                .clamp(0.0, 1.0),
        );
        let _ = pid.set_derivative_filter_time(
            settings
                .f64_or(KEY_DERIVATIVE_FILTER, pid_cfg.derivative_filter_s)
                .max(0.0),
        );
        let _ = pid.set_integrator_zone(
            settings
                .f64_or(KEY_INTEGRATOR_ZONE, pid_cfg.integrator_zone_c)
                .max(0.0),
        );
        let _ = pid.set_integrator_leak_time(
            settings
                .f64_or(KEY_INTEGRATOR_LEAK, pid_cfg.integrator_leak_s)
                .max(0.0),
        );

        // Input channels from the stored mask, config defaults otherwise.
        let config_channels: Vec<usize> = config
            .input_channels
            .iter()
            .map(|&c| c as usize)
            .filter(|&c| c < RELAY_COUNT)
            .collect();
        let mut input_channels =
            mask_to_indices(settings.u64_or(KEY_INPUTS_MASK, indices_to_mask(&config_channels)));
        if input_channels.is_empty() {
            input_channels.push(0);
        }

        // PWM relay map: stored mask + weight table, config defaults otherwise.
        let pwm_relays: HashMap<usize, f64> = if settings.contains(KEY_PWM_RELAY_MASK) {
            let weights = settings.relay_weights();
            mask_to_indices(settings.u64_or(KEY_PWM_RELAY_MASK, 0))
                .into_iter()
                .map(|relay| (relay, weights[relay].clamp(0.0, 1.0)))
                .collect()
        } else {
            config
                .pwm_relays
                .iter()
                .filter(|(&relay, _)| (relay as usize) < RELAY_COUNT)
                .map(|(&relay, &weight)| (relay as usize, weight.clamp(0.0, 1.0)))
                .collect()
        };
        let pwm_phase = pwm_relays.keys().map(|&relay| (relay, 0.0)).collect();

        let config_on: Vec<usize> = config
            .relays_on_when_running
            .iter()
            .map(|&r| r as usize)
            .filter(|&r| r < RELAY_COUNT)
            .collect();
        let relays_on_when_running =
            mask_to_indices(settings.u64_or(KEY_RELAYS_ON_MASK, indices_to_mask(&config_on)));

        let door_closed_deg = settings
            .f64_or(KEY_DOOR_CLOSED_DEG, config.door.closed_angle_deg)
            .clamp(0.0, 180.0);
        let door_open_deg = settings
            .f64_or(KEY_DOOR_OPEN_DEG, config.door.open_angle_deg)
            .clamp(0.0, 180.0);
        let door_max_speed_deg_per_s = settings
            .f64_or(KEY_DOOR_SPEED, config.door.max_speed_deg_per_s)
            .clamp(1.0, 360.0);

        let state = ControllerState {
            running: false,
            state: RunState::Idle,
            alarming: false,
            door_open: false,
            setpoint_locked_by_profile: false,
            setpoint_c: 0.0,
            process_value_c: 0.0,
            filtered_pv_c: 0.0,
            has_filtered_pv: false,
            pid_output: 0.0,
            input_filter_ms: settings
                .f64_or(KEY_INPUT_FILTER_MS, config.input_filter_ms)
                .max(1.0),
            input_channels,
            pwm_relays,
            pwm_phase,
            relays_on_when_running,
            door_closed_deg,
            door_open_deg,
            door_max_speed_deg_per_s,
            door_preview_active: false,
            door_preview_deg: door_open_deg,
        };

        Arc::new_cyclic(|weak: &Weak<Controller>| Controller {
            inner: Mutex::new(state),
            pid: Mutex::new(pid),
            pwm: SlowPwm::new(
                config.pwm_period_ms,
                0.0,
                Arc::new(RelayEdgeSink {
                    controller: weak.clone(),
                }),
            ),
            hardware,
            sensors,
            settings,
            tick_interval_ms: config.tick_interval_ms as f64,
        })
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    pub fn setpoint(&self) -> f64 {
        self.inner.lock().unwrap().setpoint_c
    }

    pub fn process_value(&self) -> f64 {
        self.inner.lock().unwrap().process_value_c
    }

    pub fn pid_output(&self) -> f64 {
        self.inner.lock().unwrap().pid_output
    }

    pub fn state_name(&self) -> String {
        self.inner.lock().unwrap().state.as_str().to_string()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    pub fn is_alarming(&self) -> bool {
        self.inner.lock().unwrap().alarming
    }

    pub fn is_door_open(&self) -> bool {
        self.inner.lock().unwrap().door_open
    }

    pub fn is_setpoint_locked_by_profile(&self) -> bool {
        self.inner.lock().unwrap().setpoint_locked_by_profile
    }

    pub fn input_filter_time_ms(&self) -> f64 {
        self.inner.lock().unwrap().input_filter_ms
    }

    pub fn input_channels(&self) -> Vec<usize> {
        let mut channels = self.inner.lock().unwrap().input_channels.clone();
        channels.sort_unstable();
        channels
    }

    pub fn relays_pwm(&self) -> HashMap<usize, f64> {
        self.inner.lock().unwrap().pwm_relays.clone()
    }

    pub fn relays_when_running(&self) -> Vec<usize> {
        let mut relays = self.inner.lock().unwrap().relays_on_when_running.clone();
        relays.sort_unstable();
        relays
    }

    /// (closed angle, open angle, max speed) of the vent door.
    pub fn door_calibration(&self) -> (f64, f64, f64) {
        let inner = self.inner.lock().unwrap();
        (
            inner.door_closed_deg,
            inner.door_open_deg,
            inner.door_max_speed_deg_per_s,
        )
    }

    pub fn last_pid_terms(&self) -> PidTerms {
        self.pid.lock().unwrap().last_terms()
    }

    /// Telemetry snapshot of the controller state.
    pub fn snapshot(&self) -> ControllerSnapshot {
        let terms = self.last_pid_terms();
        let inner = self.inner.lock().unwrap();
        ControllerSnapshot {
            state: inner.state.as_str().to_string(),
            running: inner.running,
            alarming: inner.alarming,
            door_open: inner.door_open,
            setpoint_locked_by_profile: inner.setpoint_locked_by_profile,
            setpoint_c: inner.setpoint_c,
            process_value_c: inner.process_value_c,
            pid_output: inner.pid_output,
            terms,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin regulating. Fails with `InvalidState` while alarming or when
    /// already running. Must be called from within a tokio runtime (arms the
    /// PWM task).
    pub fn start(&self) -> ControlResult<()> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.alarming {
                return Err(ControlError::InvalidState("start while alarming".into()));
            }
            if inner.running {
                return Err(ControlError::InvalidState("start while running".into()));
            }
        }

        self.running_relays_on()?;
        if let Err(err) = self.pwm.start() {
            let _ = self.running_relays_off();
            return Err(err);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.running = true;
        inner.door_preview_active = false;
        inner.state = RunState::SteadyState;
        Ok(())
    }

    /// Stop regulating: always-on relays open, PWM disarmed, all PWM relays
    /// forced open before returning. Fails with `InvalidState` when idle.
    pub fn stop(&self) -> ControlResult<()> {
        if !self.is_running() {
            return Err(ControlError::InvalidState("stop while idle".into()));
        }

        self.running_relays_off()?;
        self.pwm.set_duty_cycle(0.0);
        self.pwm.force_off();
        self.pwm.stop()?;

        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        inner.state = RunState::Idle;
        inner.pid_output = 0.0;
        Ok(())
    }

    pub fn open_door(&self) -> ControlResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.running {
            return Err(ControlError::InvalidState("door command while running".into()));
        }
        inner.door_open = true;
        inner.door_preview_active = false;
        Ok(())
    }

    pub fn close_door(&self) -> ControlResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.running {
            return Err(ControlError::InvalidState("door command while running".into()));
        }
        inner.door_open = false;
        inner.door_preview_active = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tick pipeline
    // ------------------------------------------------------------------

    /// Full tick for callers without a profile engine: fuse + alarm phase,
    /// then the regulation phase.
    pub fn run_tick(&self) -> ControlResult<()> {
        self.prepare_tick()?;
        self.regulate_tick();
        Ok(())
    }

    /// Fuse the enabled channels into the filtered process value and
    /// evaluate the alarm conditions. Returns `SensorError` when no channel
    /// produced a reading (the controller is already alarmed and stopped by
    /// the time the error is returned).
    pub fn prepare_tick(&self) -> ControlResult<()> {
        if let Err(err) = self.update_process_value() {
            let was_running = {
                let mut inner = self.inner.lock().unwrap();
                inner.alarming = true;
                inner.state = RunState::SensorError;
                inner.running
            };
            if was_running {
                let _ = self.stop();
            }
            return Err(err);
        }

        let should_alarm = {
            let inner = self.inner.lock().unwrap();
            inner.process_value_c < MIN_PROCESS_VALUE_C
                || inner.process_value_c > MAX_PROCESS_VALUE_C
        };

        let (was_alarming, was_running) = {
            let mut inner = self.inner.lock().unwrap();
            let previous = (inner.alarming, inner.running);
            if should_alarm {
                inner.alarming = true;
                inner.state = RunState::Alarming;
            } else if inner.alarming {
                inner.alarming = false;
                if !inner.running {
                    inner.state = RunState::Idle;
                }
            }
            previous
        };

        if should_alarm && !was_alarming && was_running {
            let _ = self.stop();
        }

        Ok(())
    }

    /// Regulation phase: PID + actuator dispatch while running, idle
    /// behavior otherwise.
    pub fn regulate_tick(&self) {
        if self.is_running() {
            self.regulate_running();
        } else {
            self.regulate_idle();
        }
    }

    fn regulate_running(&self) {
        let (setpoint, pv) = {
            let inner = self.inner.lock().unwrap();
            (inner.setpoint_c, inner.process_value_c)
        };

        let output = self.pid.lock().unwrap().calculate(setpoint, pv);
        self.inner.lock().unwrap().pid_output = output;

        let dt_s = self.tick_interval_ms / 1000.0;
        if output < 0.0 {
            let fraction = self.cooling_door_open_fraction(output, pv);
            let target = self.door_angle_from_fraction(fraction);
            self.apply_door_target(target, dt_s);
            self.pwm.set_duty_cycle(0.0);
            self.pwm.force_off();
        } else if output > 0.0 {
            let duty = (output / 100.0).min(1.0);
            self.pwm.set_duty_cycle(duty);
            let closed = self.inner.lock().unwrap().door_closed_deg;
            self.apply_door_target(closed, dt_s);
        } else {
            self.pwm.set_duty_cycle(0.0);
            self.pwm.force_off();
            let closed = self.inner.lock().unwrap().door_closed_deg;
            self.apply_door_target(closed, dt_s);
        }
    }

    fn regulate_idle(&self) {
        let (preview_active, preview_deg, door_open, open_deg, closed_deg) = {
            let mut inner = self.inner.lock().unwrap();
            inner.pid_output = 0.0;
            (
                inner.door_preview_active,
                inner.door_preview_deg,
                inner.door_open,
                inner.door_open_deg,
                inner.door_closed_deg,
            )
        };

        self.pwm.set_duty_cycle(0.0);
        let dt_s = self.tick_interval_ms / 1000.0;
        if preview_active {
            self.apply_door_target(preview_deg, dt_s);
        } else if door_open {
            self.apply_door_target(open_deg, dt_s);
        } else {
            self.apply_door_target(closed_deg, dt_s);
        }
    }

    fn update_process_value(&self) -> ControlResult<()> {
        let (channels, filter_ms, previous, has_previous) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.input_channels.clone(),
                inner.input_filter_ms,
                inner.filtered_pv_c,
                inner.has_filtered_pv,
            )
        };

        let mut sum = 0.0;
        let mut read_ok = 0usize;
        for channel in channels {
            let value = self.sensors.get(channel);
            if value == THERMOCOUPLE_ERROR_VALUE {
                continue;
            }
            sum += value;
            read_ok += 1;
        }

        if read_ok == 0 {
            return Err(ControlError::SensorError);
        }

        let averaged = sum / read_ok as f64;
        let dt = self.tick_interval_ms;
        let alpha = dt / (filter_ms + dt);
        let filtered = if has_previous {
            alpha * averaged + (1.0 - alpha) * previous
        } else {
            // First successful sample seeds the filter with no transient.
            averaged
        };

        let mut inner = self.inner.lock().unwrap();
        inner.filtered_pv_c = filtered;
        inner.has_filtered_pv = true;
        inner.process_value_c = filtered;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Actuator dispatch
    // ------------------------------------------------------------------

    /// Cooling demand → door open fraction, compensated for how much less
    /// effective passive venting is near room temperature. Door cooling is
    /// strongly nonlinear: small openings provide most of the effect.
    fn cooling_door_open_fraction(&self, pid_output: f64, process_value_c: f64) -> f64 {
        if pid_output >= 0.0 {
            return 0.0;
        }

        let demand = (-pid_output / 100.0).clamp(0.0, 1.0);
        let range = (MAX_PROCESS_VALUE_C - ROOM_TEMPERATURE_C).max(1.0);
        let normalized_temp = ((process_value_c - ROOM_TEMPERATURE_C) / range).clamp(0.0, 1.0);

        let effectiveness =
            MIN_DOOR_COOLING_EFFECTIVENESS + (1.0 - MIN_DOOR_COOLING_EFFECTIVENESS) * normalized_temp;
        let compensated = (demand / effectiveness.max(0.05)).clamp(0.0, 1.0);

        let open_fraction = 1.0 - (1.0 - compensated).powf(1.0 / DOOR_COOLING_NONLINEARITY);
        open_fraction.clamp(0.0, 1.0)
    }

    fn door_angle_from_fraction(&self, open_fraction: f64) -> f64 {
        let fraction = open_fraction.clamp(0.0, 1.0);
        let (closed, open) = {
            let inner = self.inner.lock().unwrap();
            (inner.door_closed_deg, inner.door_open_deg)
        };
        closed + fraction * (open - closed)
    }

    /// Move the servo toward `target_deg`, limited to the calibrated slew
    /// rate over `dt_s`.
    fn apply_door_target(&self, target_deg: f64, dt_s: f64) {
        let target = target_deg.clamp(0.0, SERVO_MAX_ANGLE);
        let dt = dt_s.max(0.0);
        let speed = {
            let inner = self.inner.lock().unwrap();
            inner.door_max_speed_deg_per_s.clamp(1.0, 360.0)
        };

        let current = self.hardware.servo_angle();
        let max_step = speed * dt;
        let delta = target - current;
        let next = if delta.abs() > max_step {
            current + max_step.copysign(delta)
        } else {
            target
        };

        if let Err(err) = self.hardware.set_servo_angle(next.clamp(0.0, SERVO_MAX_ANGLE)) {
            warn!("servo write failed: {}", err);
        }
    }

    /// ON edge of the slow PWM: apply the per-relay weights. A relay with
    /// weight w < 1 closes on roughly w of the ON edges, paced by a phase
    /// accumulator, so no extra timers are needed.
    fn pwm_relays_on_edge(&self) {
        let next_states: Vec<(usize, bool)> = {
            let mut inner = self.inner.lock().unwrap();
            Self::sync_pwm_phase_locked(&mut inner);
            let relays: Vec<(usize, f64)> = inner
                .pwm_relays
                .iter()
                .map(|(&relay, &weight)| (relay, weight.clamp(0.0, 1.0)))
                .collect();

            relays
                .into_iter()
                .map(|(relay, weight)| {
                    let closed = if weight >= 1.0 {
                        true
                    } else if weight > 0.0 {
                        let phase = inner.pwm_phase.entry(relay).or_insert(0.0);
                        *phase += weight;
                        if *phase >= 1.0 {
                            while *phase >= 1.0 {
                                *phase -= 1.0;
                            }
                            true
                        } else {
                            false
                        }
                    } else {
                        false
                    };
                    (relay, closed)
                })
                .collect()
        };

        for (relay, closed) in next_states {
            if let Err(err) = self.hardware.set_relay(relay, closed) {
                warn!("relay {} write failed: {}", relay, err);
            }
        }
    }

    /// OFF edge of the slow PWM: every configured PWM relay opens.
    fn pwm_relays_off_edge(&self) {
        let relays: Vec<usize> = {
            let inner = self.inner.lock().unwrap();
            inner.pwm_relays.keys().copied().collect()
        };
        for relay in relays {
            if let Err(err) = self.hardware.set_relay(relay, false) {
                warn!("relay {} write failed: {}", relay, err);
            }
        }
    }

    fn sync_pwm_phase_locked(inner: &mut ControllerState) {
        let configured: Vec<usize> = inner.pwm_relays.keys().copied().collect();
        inner.pwm_phase.retain(|relay, _| inner.pwm_relays.contains_key(relay));
        for relay in configured {
            inner.pwm_phase.entry(relay).or_insert(0.0);
        }
    }

    fn running_relays_on(&self) -> ControlResult<()> {
        let relays = {
            let inner = self.inner.lock().unwrap();
            inner.relays_on_when_running.clone()
        };
        for relay in relays {
            self.hardware.set_relay(relay, true)?;
        }
        Ok(())
    }

    fn running_relays_off(&self) -> ControlResult<()> {
        let relays = {
            let inner = self.inner.lock().unwrap();
            inner.relays_on_when_running.clone()
        };
        for relay in relays {
            self.hardware.set_relay(relay, false)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Setpoint
    // ------------------------------------------------------------------

    /// External setpoint write; rejected with `Conflict` while a profile
    /// holds the setpoint lock.
    pub fn set_setpoint(&self, setpoint_c: f64) -> ControlResult<()> {
        Self::check_setpoint_range(setpoint_c)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.setpoint_locked_by_profile {
            return Err(ControlError::Conflict(
                "setpoint is locked by the running profile".into(),
            ));
        }
        inner.setpoint_c = setpoint_c;
        Ok(())
    }

    /// Privileged setpoint write used by the profile engine; bypasses the
    /// setpoint lock.
    pub fn set_setpoint_from_profile(&self, setpoint_c: f64) -> ControlResult<()> {
        Self::check_setpoint_range(setpoint_c)?;
        self.inner.lock().unwrap().setpoint_c = setpoint_c;
        Ok(())
    }

    pub fn set_profile_setpoint_lock(&self, locked: bool) {
        self.inner.lock().unwrap().setpoint_locked_by_profile = locked;
    }

    fn check_setpoint_range(setpoint_c: f64) -> ControlResult<()> {
        if !setpoint_c.is_finite() || !(MIN_SETPOINT_C..=MAX_SETPOINT_C).contains(&setpoint_c) {
            return Err(ControlError::InvalidArgument(format!(
                "setpoint {} outside [{}, {}] °C",
                setpoint_c, MIN_SETPOINT_C, MAX_SETPOINT_C
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tuning setters (persisted)
    // ------------------------------------------------------------------

    pub fn set_input_filter_time(&self, filter_ms: f64) -> ControlResult<()> {
        if !filter_ms.is_finite() || filter_ms <= 0.0 {
            return Err(ControlError::InvalidArgument(format!(
                "input filter time must be > 0 ms, got {}",
                filter_ms
            )));
        }
        self.inner.lock().unwrap().input_filter_ms = filter_ms;
        self.settings.set_f64(KEY_INPUT_FILTER_MS, filter_ms)
    }

    pub fn set_heating_gains(&self, gains: PidGains) -> ControlResult<()> {
        self.pid.lock().unwrap().tune_heating(gains)?;
        self.settings.set_f64(settings::KEY_KP_HEAT, gains.kp)?;
        self.settings.set_f64(settings::KEY_KI_HEAT, gains.ki)?;
        self.settings.set_f64(settings::KEY_KD_HEAT, gains.kd)
    }

    pub fn set_cooling_gains(&self, gains: PidGains) -> ControlResult<()> {
        self.pid.lock().unwrap().tune_cooling(gains)?;
        self.settings.set_f64(settings::KEY_KP_COOL, gains.kp)?;
        self.settings.set_f64(settings::KEY_KI_COOL, gains.ki)?;
        self.settings.set_f64(settings::KEY_KD_COOL, gains.kd)
    }

    pub fn heating_gains(&self) -> PidGains {
        self.pid.lock().unwrap().heating_gains()
    }

    pub fn cooling_gains(&self) -> PidGains {
        self.pid.lock().unwrap().cooling_gains()
    }

    pub fn set_setpoint_weight(&self, weight: f64) -> ControlResult<()> {
        self.pid.lock().unwrap().set_setpoint_weight(weight)?;
        self.settings.set_f64(KEY_SETPOINT_WEIGHT, weight)
    }

    pub fn set_derivative_filter_time(&self, seconds: f64) -> ControlResult<()> {
        self.pid.lock().unwrap().set_derivative_filter_time(seconds)?;
        self.settings.set_f64(KEY_DERIVATIVE_FILTER, seconds)
    }

    pub fn set_integrator_zone(&self, zone_c: f64) -> ControlResult<()> {
        self.pid.lock().unwrap().set_integrator_zone(zone_c)?;
        self.settings.set_f64(KEY_INTEGRATOR_ZONE, zone_c)
    }

    pub fn set_integrator_leak_time(&self, seconds: f64) -> ControlResult<()> {
        self.pid.lock().unwrap().set_integrator_leak_time(seconds)?;
        self.settings.set_f64(KEY_INTEGRATOR_LEAK, seconds)
    }

    pub fn reset_pid(&self) {
        self.pid.lock().unwrap().reset();
    }

    // ------------------------------------------------------------------
    // Input channel set (persisted)
    // ------------------------------------------------------------------

    pub fn add_input_channel(&self, channel: usize) -> ControlResult<()> {
        if channel > 7 {
            return Err(ControlError::InvalidArgument(format!(
                "input channel {} out of range [0, 7]",
                channel
            )));
        }
        let mask = {
            let mut inner = self.inner.lock().unwrap();
            if inner.input_channels.contains(&channel) {
                return Err(ControlError::InvalidArgument(format!(
                    "input channel {} already enabled",
                    channel
                )));
            }
            inner.input_channels.push(channel);
            indices_to_mask(&inner.input_channels)
        };
        self.settings.set_u64(KEY_INPUTS_MASK, mask)
    }

    pub fn remove_input_channel(&self, channel: usize) -> ControlResult<()> {
        let mask = {
            let mut inner = self.inner.lock().unwrap();
            let position = inner
                .input_channels
                .iter()
                .position(|&c| c == channel)
                .ok_or_else(|| {
                    ControlError::InvalidArgument(format!("input channel {} not enabled", channel))
                })?;
            inner.input_channels.remove(position);
            // The fused input set never goes empty.
            if inner.input_channels.is_empty() {
                inner.input_channels.push(0);
            }
            indices_to_mask(&inner.input_channels)
        };
        self.settings.set_u64(KEY_INPUTS_MASK, mask)
    }

    pub fn set_input_channels(&self, channels: &[usize]) -> ControlResult<()> {
        if channels.is_empty() {
            return Err(ControlError::InvalidArgument(
                "input channel set must not be empty".into(),
            ));
        }
        let mut sanitized: Vec<usize> = Vec::with_capacity(channels.len());
        for &channel in channels {
            if channel > 7 {
                return Err(ControlError::InvalidArgument(format!(
                    "input channel {} out of range [0, 7]",
                    channel
                )));
            }
            if !sanitized.contains(&channel) {
                sanitized.push(channel);
            }
        }
        let mask = {
            let mut inner = self.inner.lock().unwrap();
            inner.input_channels = sanitized;
            indices_to_mask(&inner.input_channels)
        };
        self.settings.set_u64(KEY_INPUTS_MASK, mask)
    }

    // ------------------------------------------------------------------
    // PWM relay set (persisted)
    // ------------------------------------------------------------------

    pub fn set_relay_pwm(&self, relay: usize, weight: f64) -> ControlResult<()> {
        if relay > 7 {
            return Err(ControlError::InvalidArgument(format!(
                "relay {} out of range [0, 7]",
                relay
            )));
        }
        if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
            return Err(ControlError::InvalidArgument(format!(
                "relay weight {} outside [0, 1]",
                weight
            )));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pwm_relays.insert(relay, weight);
            Self::sync_pwm_phase_locked(&mut inner);
        }
        self.persist_pwm_relays()
    }

    pub fn remove_relay_pwm(&self, relay: usize) -> ControlResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.pwm_relays.remove(&relay).is_none() {
                return Err(ControlError::InvalidArgument(format!(
                    "relay {} is not in the PWM set",
                    relay
                )));
            }
            Self::sync_pwm_phase_locked(&mut inner);
        }
        self.persist_pwm_relays()
    }

    /// Replace the PWM relay set; relays already present keep their weight,
    /// new relays enter at full weight.
    pub fn set_relay_pwm_enabled(&self, relays: &[usize]) -> ControlResult<()> {
        for &relay in relays {
            if relay > 7 {
                return Err(ControlError::InvalidArgument(format!(
                    "relay {} out of range [0, 7]",
                    relay
                )));
            }
        }
        {
            let mut inner = self.inner.lock().unwrap();
            let mut next: HashMap<usize, f64> = relays.iter().map(|&r| (r, 1.0)).collect();
            for (relay, weight) in next.iter_mut() {
                if let Some(&existing) = inner.pwm_relays.get(relay) {
                    *weight = existing.clamp(0.0, 1.0);
                }
            }
            inner.pwm_relays = next;
            Self::sync_pwm_phase_locked(&mut inner);
        }
        self.persist_pwm_relays()
    }

    /// Replace the whole PWM relay map, weights included.
    pub fn set_relays_pwm(&self, relay_weights: &HashMap<usize, f64>) -> ControlResult<()> {
        let mut sanitized = HashMap::with_capacity(relay_weights.len());
        for (&relay, &weight) in relay_weights {
            if relay > 7 {
                return Err(ControlError::InvalidArgument(format!(
                    "relay {} out of range [0, 7]",
                    relay
                )));
            }
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(ControlError::InvalidArgument(format!(
                    "relay weight {} outside [0, 1]",
                    weight
                )));
            }
            sanitized.insert(relay, weight);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pwm_relays = sanitized;
            Self::sync_pwm_phase_locked(&mut inner);
        }
        self.persist_pwm_relays()
    }

    fn persist_pwm_relays(&self) -> ControlResult<()> {
        let mut weights = self.settings.relay_weights();
        let mask = {
            let inner = self.inner.lock().unwrap();
            let mut mask = 0u64;
            for (&relay, &weight) in &inner.pwm_relays {
                if relay < RELAY_COUNT {
                    mask |= 1 << relay;
                    weights[relay] = weight.clamp(0.0, 1.0);
                }
            }
            mask
        };
        self.settings.set_u64(KEY_PWM_RELAY_MASK, mask)?;
        self.settings.set_relay_weights(&weights)
    }

    // ------------------------------------------------------------------
    // Always-on relay set (persisted)
    // ------------------------------------------------------------------

    pub fn add_relay_when_running(&self, relay: usize) -> ControlResult<()> {
        if relay > 7 {
            return Err(ControlError::InvalidArgument(format!(
                "relay {} out of range [0, 7]",
                relay
            )));
        }
        let mask = {
            let mut inner = self.inner.lock().unwrap();
            if inner.relays_on_when_running.contains(&relay) {
                return Err(ControlError::InvalidArgument(format!(
                    "relay {} already in the always-on set",
                    relay
                )));
            }
            inner.relays_on_when_running.push(relay);
            indices_to_mask(&inner.relays_on_when_running)
        };
        self.settings.set_u64(KEY_RELAYS_ON_MASK, mask)
    }

    pub fn remove_relay_when_running(&self, relay: usize) -> ControlResult<()> {
        let mask = {
            let mut inner = self.inner.lock().unwrap();
            let position = inner
                .relays_on_when_running
                .iter()
                .position(|&r| r == relay)
                .ok_or_else(|| {
                    ControlError::InvalidArgument(format!(
                        "relay {} is not in the always-on set",
                        relay
                    ))
                })?;
            inner.relays_on_when_running.remove(position);
            indices_to_mask(&inner.relays_on_when_running)
        };
        self.settings.set_u64(KEY_RELAYS_ON_MASK, mask)
    }

    pub fn set_relays_when_running(&self, relays: &[usize]) -> ControlResult<()> {
        let mut sanitized: Vec<usize> = Vec::with_capacity(relays.len());
        for &relay in relays {
            if relay > 7 {
                return Err(ControlError::InvalidArgument(format!(
                    "relay {} out of range [0, 7]",
                    relay
                )));
            }
            if !sanitized.contains(&relay) {
                sanitized.push(relay);
            }
        }
        let mask = {
            let mut inner = self.inner.lock().unwrap();
            inner.relays_on_when_running = sanitized;
            indices_to_mask(&inner.relays_on_when_running)
        };
        self.settings.set_u64(KEY_RELAYS_ON_MASK, mask)
    }

    // ------------------------------------------------------------------
    // Door calibration and preview (persisted where noted)
    // ------------------------------------------------------------------

    pub fn set_door_calibration(&self, closed_deg: f64, open_deg: f64) -> ControlResult<()> {
        for angle in [closed_deg, open_deg] {
            if !angle.is_finite() || !(0.0..=180.0).contains(&angle) {
                return Err(ControlError::InvalidArgument(format!(
                    "door angle {} outside [0, 180]",
                    angle
                )));
            }
        }

        let (running, target) = {
            let mut inner = self.inner.lock().unwrap();
            inner.door_closed_deg = closed_deg;
            inner.door_open_deg = open_deg;
            let target = if inner.door_preview_active {
                inner.door_preview_deg
            } else if inner.door_open {
                open_deg
            } else {
                closed_deg
            };
            (inner.running, target)
        };

        self.settings.set_f64(KEY_DOOR_CLOSED_DEG, closed_deg)?;
        self.settings.set_f64(KEY_DOOR_OPEN_DEG, open_deg)?;

        if !running {
            self.apply_door_target(target, self.tick_interval_ms / 1000.0);
        }
        Ok(())
    }

    pub fn set_door_max_speed(&self, speed_deg_per_s: f64) -> ControlResult<()> {
        if !speed_deg_per_s.is_finite() || !(1.0..=360.0).contains(&speed_deg_per_s) {
            return Err(ControlError::InvalidArgument(format!(
                "door speed {} outside [1, 360] deg/s",
                speed_deg_per_s
            )));
        }
        self.inner.lock().unwrap().door_max_speed_deg_per_s = speed_deg_per_s;
        self.settings.set_f64(KEY_DOOR_SPEED, speed_deg_per_s)
    }

    /// Park the door at an arbitrary angle for calibration; only while idle.
    pub fn set_door_preview_angle(&self, angle_deg: f64) -> ControlResult<()> {
        if !angle_deg.is_finite() || !(0.0..=180.0).contains(&angle_deg) {
            return Err(ControlError::InvalidArgument(format!(
                "preview angle {} outside [0, 180]",
                angle_deg
            )));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.running {
                return Err(ControlError::InvalidState(
                    "door preview while running".into(),
                ));
            }
            inner.door_preview_active = true;
            inner.door_preview_deg = angle_deg;
        }
        self.apply_door_target(angle_deg, self.tick_interval_ms / 1000.0);
        Ok(())
    }

    pub fn clear_door_preview(&self) -> ControlResult<()> {
        let target = {
            let mut inner = self.inner.lock().unwrap();
            if inner.running {
                return Err(ControlError::InvalidState(
                    "door preview while running".into(),
                ));
            }
            inner.door_preview_active = false;
            if inner.door_open {
                inner.door_open_deg
            } else {
                inner.door_closed_deg
            }
        };
        self.apply_door_target(target, self.tick_interval_ms / 1000.0);
        Ok(())
    }

    /// Tick period of this controller, seconds.
    pub fn tick_interval_s(&self) -> f64 {
        self.tick_interval_ms / 1000.0
    }

    /// Debug helper used by the daemon heartbeat.
    pub fn describe(&self) -> String {
        let snapshot = self.snapshot();
        let mode = if snapshot.pid_output > 0.0 {
            "HEAT"
        } else if snapshot.pid_output < 0.0 {
            "VENT"
        } else {
            "HOLD"
        };
        format!(
            "{} sp={:.1} pv={:.1} out={:.1} ({}) alarm={}",
            snapshot.state,
            snapshot.setpoint_c,
            snapshot.process_value_c,
            snapshot.pid_output,
            mode,
            snapshot.alarming
        )
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        debug!("controller dropped, disarming PWM");
        let _ = self.pwm.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, HardwareConfig};
    use crate::control::clock::ManualClock;
    use crate::hardware::MockOvenDriver;

    struct Bench {
        controller: Arc<Controller>,
        hardware: Arc<MockOvenDriver>,
        sensors: Arc<SensorBank>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn bench_with(config: ControllerConfig) -> Bench {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Arc::new(SettingsStore::open(dir.path().join("settings.json")));
        let mut hw_config = HardwareConfig::default();
        hw_config.mock.sensor_noise_c = 0.0;
        let hardware = Arc::new(MockOvenDriver::new(&hw_config));
        let sensors = Arc::new(SensorBank::new());
        let clock = Arc::new(ManualClock::new());
        let controller = Controller::new(
            &config,
            hardware.clone(),
            sensors.clone(),
            settings,
            clock.clone(),
        );
        Bench {
            controller,
            hardware,
            sensors,
            clock,
            _dir: dir,
        }
    }

    fn bench() -> Bench {
        bench_with(ControllerConfig::default())
    }

    fn feed_pv(bench: &Bench, value: f64) {
        bench.sensors.store(0, value);
    }

    #[test]
    fn test_sensor_fusion_averages_good_channels() {
        let bench = bench();
        bench.controller.set_input_channels(&[0, 1, 2]).unwrap();
        bench.sensors.store(0, 100.0);
        bench.sensors.store(1, 110.0);
        // Channel 2 stays at the error sentinel and is skipped.

        bench.controller.prepare_tick().unwrap();
        assert_eq!(bench.controller.process_value(), 105.0);
    }

    #[test]
    fn test_sensor_error_alarms_and_latches_state() {
        let bench = bench();
        // No channel ever reported: every read is the sentinel.
        let result = bench.controller.prepare_tick();
        assert!(matches!(result, Err(ControlError::SensorError)));
        assert!(bench.controller.is_alarming());
        assert_eq!(bench.controller.state_name(), "Sensor Error");
    }

    #[test]
    fn test_input_filter_smooths_steps_after_seed() {
        let mut config = ControllerConfig::default();
        config.input_filter_ms = 250.0;
        let bench = bench_with(config);

        feed_pv(&bench, 100.0);
        bench.controller.prepare_tick().unwrap();
        // First sample seeds the filter with no transient.
        assert_eq!(bench.controller.process_value(), 100.0);

        feed_pv(&bench, 200.0);
        bench.controller.prepare_tick().unwrap();
        // alpha = 250 / (250 + 250) = 0.5
        assert!((bench.controller.process_value() - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_alarm_on_overtemperature_and_recovery() {
        let bench = bench();
        feed_pv(&bench, 350.0);
        bench.controller.prepare_tick().unwrap();
        assert!(bench.controller.is_alarming());
        assert_eq!(bench.controller.state_name(), "Alarming");

        // Back in band (filter needs a few ticks to pull the PV down).
        feed_pv(&bench, 100.0);
        for _ in 0..40 {
            bench.controller.prepare_tick().unwrap();
        }
        assert!(!bench.controller.is_alarming());
        assert_eq!(bench.controller.state_name(), "Idle");
    }

    #[tokio::test]
    async fn test_alarm_blocks_start() {
        let bench = bench();
        feed_pv(&bench, 400.0);
        bench.controller.prepare_tick().unwrap();
        assert!(matches!(
            bench.controller.start(),
            Err(ControlError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let bench = bench();
        feed_pv(&bench, 25.0);
        bench.controller.prepare_tick().unwrap();

        bench.controller.start().unwrap();
        assert!(bench.controller.is_running());
        assert_eq!(bench.controller.state_name(), "Steady State");
        // Default always-on relay set is {2}.
        assert!(bench.hardware.relay_state(2));

        assert!(matches!(
            bench.controller.start(),
            Err(ControlError::InvalidState(_))
        ));

        bench.controller.stop().unwrap();
        assert!(!bench.controller.is_running());
        assert!(!bench.hardware.relay_state(2));
        assert_eq!(bench.controller.pid_output(), 0.0);

        assert!(matches!(
            bench.controller.stop(),
            Err(ControlError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_over_temperature_stops_running_controller() {
        let bench = bench();
        feed_pv(&bench, 25.0);
        bench.controller.prepare_tick().unwrap();
        bench.controller.start().unwrap();

        // Force an out-of-band fused value in one tick: bypass the filter
        // by making the filter fast.
        bench.controller.set_input_filter_time(1.0).unwrap();
        feed_pv(&bench, 400.0);
        for _ in 0..10 {
            bench.controller.prepare_tick().unwrap();
        }
        assert!(bench.controller.is_alarming());
        assert!(!bench.controller.is_running());
    }

    #[test]
    fn test_setpoint_validation_and_profile_lock() {
        let bench = bench();
        assert!(bench.controller.set_setpoint(150.0).is_ok());
        assert!(bench.controller.set_setpoint(-5.0).is_err());
        assert!(bench.controller.set_setpoint(301.0).is_err());

        bench.controller.set_profile_setpoint_lock(true);
        assert!(matches!(
            bench.controller.set_setpoint(100.0),
            Err(ControlError::Conflict(_))
        ));
        // The profile path bypasses the lock.
        bench.controller.set_setpoint_from_profile(120.0).unwrap();
        assert_eq!(bench.controller.setpoint(), 120.0);

        bench.controller.set_profile_setpoint_lock(false);
        assert!(bench.controller.set_setpoint(100.0).is_ok());
    }

    #[test]
    fn test_cooling_door_fraction_matches_model() {
        let bench = bench();
        // pv = 200 °C, y = -50: worked example from the door-cooling model.
        let fraction = bench.controller.cooling_door_open_fraction(-50.0, 200.0);
        assert!((fraction - 0.278).abs() < 0.005, "fraction = {}", fraction);

        // Heating output never opens the door.
        assert_eq!(bench.controller.cooling_door_open_fraction(50.0, 200.0), 0.0);

        // Full demand at high temperature saturates the opening.
        let saturated = bench.controller.cooling_door_open_fraction(-100.0, 290.0);
        assert!((saturated - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_door_angle_interpolates_calibration() {
        let bench = bench();
        bench.controller.set_door_calibration(10.0, 110.0).unwrap();
        assert_eq!(bench.controller.door_angle_from_fraction(0.0), 10.0);
        assert_eq!(bench.controller.door_angle_from_fraction(0.5), 60.0);
        assert_eq!(bench.controller.door_angle_from_fraction(1.0), 110.0);
    }

    #[test]
    fn test_servo_motion_is_rate_limited() {
        let bench = bench();
        bench.controller.set_door_max_speed(60.0).unwrap();
        assert_eq!(bench.hardware.servo_angle(), 0.0);

        // 60 deg/s over a 250 ms tick moves at most 15 degrees.
        bench.controller.apply_door_target(90.0, 0.25);
        assert!((bench.hardware.servo_angle() - 15.0).abs() < 1e-9);
        bench.controller.apply_door_target(90.0, 0.25);
        assert!((bench.hardware.servo_angle() - 30.0).abs() < 1e-9);

        // Close to the target it snaps exactly.
        bench.controller.apply_door_target(32.0, 0.25);
        assert_eq!(bench.hardware.servo_angle(), 32.0);
    }

    #[test]
    fn test_relay_weighting_converges_to_duty_times_weight() {
        let bench = bench();
        bench
            .controller
            .set_relays_pwm(&HashMap::from([(0, 1.0), (1, 0.5), (3, 0.25)]))
            .unwrap();

        let cycles = 1000;
        let mut closed_counts = [0u32; 8];
        for _ in 0..cycles {
            bench.controller.pwm_relays_on_edge();
            for relay in 0..8 {
                if bench.hardware.relay_state(relay) {
                    closed_counts[relay] += 1;
                }
            }
            bench.controller.pwm_relays_off_edge();
        }

        // Weight 1.0 closes every ON edge; fractional weights close on
        // weight-of-edges within 1%.
        assert_eq!(closed_counts[0], cycles);
        let ratio_1 = closed_counts[1] as f64 / cycles as f64;
        let ratio_3 = closed_counts[3] as f64 / cycles as f64;
        assert!((ratio_1 - 0.5).abs() < 0.01, "ratio_1 = {}", ratio_1);
        assert!((ratio_3 - 0.25).abs() < 0.01, "ratio_3 = {}", ratio_3);
        // Relays outside the PWM set never close.
        assert_eq!(closed_counts[2], 0);
    }

    #[test]
    fn test_zero_weight_relay_stays_open() {
        let bench = bench();
        bench
            .controller
            .set_relays_pwm(&HashMap::from([(4, 0.0)]))
            .unwrap();
        for _ in 0..20 {
            bench.controller.pwm_relays_on_edge();
            assert!(!bench.hardware.relay_state(4));
            bench.controller.pwm_relays_off_edge();
        }
    }

    #[tokio::test]
    async fn test_running_dispatch_heating_sets_duty() {
        let bench = bench();
        feed_pv(&bench, 25.0);
        bench.controller.prepare_tick().unwrap();
        bench.controller.set_setpoint(150.0).unwrap();
        bench
            .controller
            .set_heating_gains(PidGains::new(2.0, 0.0, 0.0))
            .unwrap();
        bench
            .controller
            .set_cooling_gains(PidGains::new(0.0, 0.0, 0.0))
            .unwrap();
        bench.controller.start().unwrap();

        bench.controller.regulate_tick();
        let output = bench.controller.pid_output();
        assert!(output > 0.0);
        assert!((bench.controller.pwm.duty_cycle() - (output / 100.0).min(1.0)).abs() < 1e-9);

        bench.controller.stop().unwrap();
    }

    #[tokio::test]
    async fn test_running_dispatch_cooling_moves_door() {
        let mut config = ControllerConfig::default();
        config.door.max_speed_deg_per_s = 360.0;
        let bench = bench_with(config);
        feed_pv(&bench, 200.0);
        bench.controller.set_input_filter_time(1.0).unwrap();
        for _ in 0..10 {
            bench.controller.prepare_tick().unwrap();
        }
        bench.controller.set_setpoint(100.0).unwrap();
        bench
            .controller
            .set_heating_gains(PidGains::new(0.0, 0.0, 0.0))
            .unwrap();
        bench
            .controller
            .set_cooling_gains(PidGains::new(1.0, 0.0, 0.0))
            .unwrap();
        bench.controller.start().unwrap();

        bench.clock.advance_secs(0.25);
        bench.controller.regulate_tick();
        assert!(bench.controller.pid_output() < 0.0);
        assert_eq!(bench.controller.pwm.duty_cycle(), 0.0);
        assert!(bench.hardware.servo_angle() > 0.0);

        bench.controller.stop().unwrap();
    }

    #[test]
    fn test_idle_door_follows_open_close_and_preview() {
        let mut config = ControllerConfig::default();
        config.door.max_speed_deg_per_s = 360.0;
        let bench = bench_with(config);

        bench.controller.open_door().unwrap();
        for _ in 0..5 {
            bench.controller.regulate_tick();
        }
        assert_eq!(bench.hardware.servo_angle(), 90.0);

        bench.controller.close_door().unwrap();
        for _ in 0..5 {
            bench.controller.regulate_tick();
        }
        assert_eq!(bench.hardware.servo_angle(), 0.0);

        bench.controller.set_door_preview_angle(45.0).unwrap();
        for _ in 0..5 {
            bench.controller.regulate_tick();
        }
        assert_eq!(bench.hardware.servo_angle(), 45.0);

        bench.controller.clear_door_preview().unwrap();
        for _ in 0..5 {
            bench.controller.regulate_tick();
        }
        assert_eq!(bench.hardware.servo_angle(), 0.0);
    }

    #[test]
    fn test_input_channel_set_never_goes_empty() {
        let bench = bench();
        assert_eq!(bench.controller.input_channels(), vec![0]);
        bench.controller.remove_input_channel(0).unwrap();
        assert_eq!(bench.controller.input_channels(), vec![0]);

        bench.controller.add_input_channel(3).unwrap();
        assert_eq!(bench.controller.input_channels(), vec![0, 3]);
        assert!(bench.controller.add_input_channel(3).is_err());
        assert!(bench.controller.add_input_channel(8).is_err());
    }

    #[test]
    fn test_pwm_relay_set_editing_preserves_weights() {
        let bench = bench();
        bench.controller.set_relay_pwm(5, 0.3).unwrap();
        assert_eq!(bench.controller.relays_pwm().get(&5), Some(&0.3));

        // Re-enabling keeps the stored weight.
        bench.controller.set_relay_pwm_enabled(&[5, 6]).unwrap();
        let map = bench.controller.relays_pwm();
        assert_eq!(map.get(&5), Some(&0.3));
        assert_eq!(map.get(&6), Some(&1.0));

        bench.controller.remove_relay_pwm(6).unwrap();
        assert!(bench.controller.remove_relay_pwm(6).is_err());
        assert!(bench.controller.set_relay_pwm(9, 0.5).is_err());
        assert!(bench.controller.set_relay_pwm(1, 1.5).is_err());
    }

    #[test]
    fn test_settings_survive_controller_rebuild() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");
        let mut hw_config = HardwareConfig::default();
        hw_config.mock.sensor_noise_c = 0.0;

        {
            let settings = Arc::new(SettingsStore::open(&settings_path));
            let controller = Controller::new(
                &ControllerConfig::default(),
                Arc::new(MockOvenDriver::new(&hw_config)),
                Arc::new(SensorBank::new()),
                settings,
                Arc::new(ManualClock::new()),
            );
            controller
                .set_heating_gains(PidGains::new(9.0, 0.9, 0.09))
                .unwrap();
            controller.set_input_channels(&[1, 2]).unwrap();
            controller.set_door_calibration(5.0, 95.0).unwrap();
        }

        let settings = Arc::new(SettingsStore::open(&settings_path));
        let controller = Controller::new(
            &ControllerConfig::default(),
            Arc::new(MockOvenDriver::new(&hw_config)),
            Arc::new(SensorBank::new()),
            settings,
            Arc::new(ManualClock::new()),
        );
        assert_eq!(controller.heating_gains(), PidGains::new(9.0, 0.9, 0.09));
        assert_eq!(controller.input_channels(), vec![1, 2]);
        let (closed, open, _) = controller.door_calibration();
        assert_eq!((closed, open), (5.0, 95.0));
    }

    #[test]
    fn test_door_commands_rejected_while_running() {
        let bench = bench();
        bench.inner_set_running(true);
        assert!(bench.controller.open_door().is_err());
        assert!(bench.controller.close_door().is_err());
        assert!(bench.controller.set_door_preview_angle(30.0).is_err());
        assert!(bench.controller.clear_door_preview().is_err());
    }

    impl Bench {
        fn inner_set_running(&self, running: bool) {
            self.controller.inner.lock().unwrap().running = running;
        }
    }
}
