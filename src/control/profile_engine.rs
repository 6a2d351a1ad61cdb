// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Profile execution engine
//!
//! Runs one validated profile at a time, rewriting the controller setpoint
//! each tick while holding the controller's setpoint lock. Holds one
//! volatile uploaded profile plus up to [`MAX_SLOTS`] persisted slots.
//!
//! Within a tick the engine may traverse several zero-duration steps
//! (direct writes, immediate jumps); a transition counter caps the traversal
//! at [`MAX_TRANSITIONS_PER_TICK`] and aborts the run when exceeded.
//!
//! Lock discipline: controller values are snapshotted before the engine
//! lock is taken, state is mutated under the lock while the effective
//! setpoint is tracked locally, and all controller writes (setpoint, lock
//! flag, stop) are applied after the lock is released. The engine lock is
//! never held across a controller lock acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::settings::SettingsStore;

use super::controller::Controller;
use super::error::{ControlError, ControlResult};
use super::profile::{ProfileDefinition, ProfileStep, PV_TOLERANCE_C};

/// Number of persisted profile slots.
pub const MAX_SLOTS: usize = 5;

/// Bounded-work invariant on per-tick state machine traversal.
pub const MAX_TRANSITIONS_PER_TICK: u32 = 256;

/// Why the last run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileEndReason {
    None,
    Completed,
    CancelledByUser,
    ControllerStopped,
    TransitionGuard,
    StartFailed,
    InvalidProfile,
}

impl ProfileEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileEndReason::None => "none",
            ProfileEndReason::Completed => "completed",
            ProfileEndReason::CancelledByUser => "cancelled_by_user",
            ProfileEndReason::ControllerStopped => "controller_stopped",
            ProfileEndReason::TransitionGuard => "transition_guard_abort",
            ProfileEndReason::StartFailed => "start_failed",
            ProfileEndReason::InvalidProfile => "invalid_profile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProfileSource {
    None,
    Uploaded,
    Slot,
}

impl ProfileSource {
    fn as_str(self) -> &'static str {
        match self {
            ProfileSource::None => "none",
            ProfileSource::Uploaded => "uploaded",
            ProfileSource::Slot => "slot",
        }
    }
}

/// Runtime status exposed upward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRuntimeStatus {
    pub running: bool,
    pub name: String,
    pub source: String,
    pub slot_index: i32,
    pub current_step_number: u32,
    pub current_step_type: String,
    pub step_elapsed_s: f64,
    pub profile_elapsed_s: f64,
    pub last_end_reason: String,
}

/// Summary of one persisted slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSlotSummary {
    pub slot_index: usize,
    pub occupied: bool,
    pub name: String,
    pub step_count: usize,
}

struct EngineState {
    uploaded: Option<ProfileDefinition>,

    running: bool,
    active: ProfileDefinition,
    source: ProfileSource,
    slot_index: i32,
    step_index: usize,
    step_elapsed_s: f64,
    profile_elapsed_s: f64,
    step_start_setpoint_c: f64,
    wait_time_latched: bool,
    wait_pv_latched: bool,
    soak_accumulated_s: f64,
    jump_remaining: HashMap<usize, i64>,
    last_end_reason: ProfileEndReason,
}

impl EngineState {
    fn idle() -> Self {
        Self {
            uploaded: None,
            running: false,
            active: ProfileDefinition {
                schema_version: super::profile::SCHEMA_VERSION,
                name: String::new(),
                description: String::new(),
                steps: Vec::new(),
            },
            source: ProfileSource::None,
            slot_index: -1,
            step_index: 0,
            step_elapsed_s: 0.0,
            profile_elapsed_s: 0.0,
            step_start_setpoint_c: 0.0,
            wait_time_latched: false,
            wait_pv_latched: false,
            soak_accumulated_s: 0.0,
            jump_remaining: HashMap::new(),
            last_end_reason: ProfileEndReason::None,
        }
    }
}

/// Controller writes collected under the engine lock and applied after it
/// is released.
#[derive(Default)]
struct TickActions {
    setpoint_writes: Vec<f64>,
    clear_lock: bool,
    stop_controller: bool,
}

/// The profile engine.
pub struct ProfileEngine {
    inner: Mutex<EngineState>,
    controller: Arc<Controller>,
    settings: Arc<SettingsStore>,
}

fn slot_blob_key(slot_index: usize) -> String {
    format!("slot{}_blob", slot_index)
}

fn slot_name_key(slot_index: usize) -> String {
    format!("slot{}_name", slot_index)
}

fn check_slot_index(slot_index: usize) -> ControlResult<()> {
    if slot_index >= MAX_SLOTS {
        return Err(ControlError::InvalidArgument(format!(
            "slot index {} out of range [0, {}]",
            slot_index,
            MAX_SLOTS - 1
        )));
    }
    Ok(())
}

fn validation_failure(errors: &[super::profile::ProfileValidationError]) -> ControlError {
    let detail = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    ControlError::InvalidArgument(format!("invalid profile: {}", detail))
}

impl ProfileEngine {
    pub fn new(controller: Arc<Controller>, settings: Arc<SettingsStore>) -> Self {
        Self {
            inner: Mutex::new(EngineState::idle()),
            controller,
            settings,
        }
    }

    // ------------------------------------------------------------------
    // Uploaded profile
    // ------------------------------------------------------------------

    /// Stage a volatile profile. Invalid profiles never enter the engine.
    pub fn set_uploaded_profile(&self, profile: ProfileDefinition) -> ControlResult<()> {
        let errors = profile.validate();
        if !errors.is_empty() {
            return Err(validation_failure(&errors));
        }
        self.inner.lock().unwrap().uploaded = Some(profile);
        Ok(())
    }

    pub fn uploaded_profile(&self) -> Option<ProfileDefinition> {
        self.inner.lock().unwrap().uploaded.clone()
    }

    pub fn clear_uploaded_profile(&self) {
        self.inner.lock().unwrap().uploaded = None;
    }

    // ------------------------------------------------------------------
    // Persisted slots
    // ------------------------------------------------------------------

    /// Save a profile into an empty slot. Occupied slots must be deleted
    /// explicitly first.
    pub fn save_profile_to_slot(
        &self,
        slot_index: usize,
        profile: &ProfileDefinition,
    ) -> ControlResult<()> {
        check_slot_index(slot_index)?;
        let errors = profile.validate();
        if !errors.is_empty() {
            return Err(validation_failure(&errors));
        }
        if self.settings.contains(&slot_blob_key(slot_index)) {
            return Err(ControlError::Conflict(format!(
                "slot {} is occupied",
                slot_index
            )));
        }

        self.settings
            .set_string(&slot_blob_key(slot_index), &profile.to_json())?;
        self.settings
            .set_string(&slot_name_key(slot_index), &profile.name)
    }

    /// Delete a slot. Deleting an empty slot is a no-op.
    pub fn delete_slot_profile(&self, slot_index: usize) -> ControlResult<()> {
        check_slot_index(slot_index)?;
        self.settings.remove(&slot_blob_key(slot_index))?;
        self.settings.remove(&slot_name_key(slot_index))?;
        Ok(())
    }

    /// Load and re-validate the profile stored in a slot.
    pub fn slot_profile(&self, slot_index: usize) -> ControlResult<ProfileDefinition> {
        check_slot_index(slot_index)?;
        let blob = self
            .settings
            .string(&slot_blob_key(slot_index))
            .ok_or_else(|| ControlError::NotFound(format!("slot {} is empty", slot_index)))?;
        ProfileDefinition::from_json(&blob).map_err(|errors| validation_failure(&errors))
    }

    /// Occupancy overview of all slots. Slots whose stored blob no longer
    /// parses or validates are reported unoccupied.
    pub fn slot_summaries(&self) -> Vec<ProfileSlotSummary> {
        (0..MAX_SLOTS)
            .map(|slot_index| match self.slot_profile(slot_index) {
                Ok(profile) => ProfileSlotSummary {
                    slot_index,
                    occupied: true,
                    name: profile.name.clone(),
                    step_count: profile.steps.len(),
                },
                Err(_) => ProfileSlotSummary {
                    slot_index,
                    occupied: false,
                    name: String::new(),
                    step_count: 0,
                },
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Run control
    // ------------------------------------------------------------------

    /// Start the uploaded profile.
    pub fn start_from_uploaded(&self) -> ControlResult<()> {
        let profile = self
            .uploaded_profile()
            .ok_or_else(|| ControlError::NotFound("no uploaded profile".into()))?;
        self.start_with_profile(profile, ProfileSource::Uploaded, -1)
    }

    /// Start the profile stored in `slot_index`.
    pub fn start_from_slot(&self, slot_index: usize) -> ControlResult<()> {
        let profile = match self.slot_profile(slot_index) {
            Ok(profile) => profile,
            Err(err) => {
                if matches!(&err, ControlError::InvalidArgument(_)) {
                    self.inner.lock().unwrap().last_end_reason = ProfileEndReason::InvalidProfile;
                }
                return Err(err);
            }
        };
        self.start_with_profile(profile, ProfileSource::Slot, slot_index as i32)
    }

    fn start_with_profile(
        &self,
        profile: ProfileDefinition,
        source: ProfileSource,
        slot_index: i32,
    ) -> ControlResult<()> {
        let errors = profile.validate();
        if !errors.is_empty() {
            self.inner.lock().unwrap().last_end_reason = ProfileEndReason::InvalidProfile;
            return Err(validation_failure(&errors));
        }

        let start_setpoint = self.controller.setpoint();
        {
            let mut state = self.inner.lock().unwrap();
            if state.running {
                return Err(ControlError::InvalidState("profile already running".into()));
            }

            state.jump_remaining = profile
                .steps
                .iter()
                .enumerate()
                .filter_map(|(index, step)| match step {
                    ProfileStep::Jump { repeat_count, .. } => Some((index, *repeat_count)),
                    _ => None,
                })
                .collect();

            state.active = profile;
            state.source = source;
            state.slot_index = slot_index;
            state.running = true;
            state.last_end_reason = ProfileEndReason::None;
            state.profile_elapsed_s = 0.0;
            Self::enter_step_locked(&mut state, 0, start_setpoint);
        }

        info!("profile run starting ({})", source.as_str());
        self.controller.set_profile_setpoint_lock(true);

        if !self.controller.is_running() {
            if let Err(err) = self.controller.start() {
                warn!("controller start failed, aborting profile run: {}", err);
                let mut actions = TickActions::default();
                {
                    let mut state = self.inner.lock().unwrap();
                    Self::end_run_locked(
                        &mut state,
                        ProfileEndReason::StartFailed,
                        false,
                        &mut actions,
                    );
                }
                self.apply_actions(actions);
                return Err(err);
            }
        }

        // Lead-in tick: process any zero-duration steps at the head.
        self.tick(0.0);
        Ok(())
    }

    /// Cancel a running profile. The controller is stopped as for any
    /// user-initiated end of run.
    pub fn cancel_running(&self) -> ControlResult<()> {
        let mut actions = TickActions::default();
        {
            let mut state = self.inner.lock().unwrap();
            if !state.running {
                return Err(ControlError::InvalidState("no profile running".into()));
            }
            Self::end_run_locked(
                &mut state,
                ProfileEndReason::CancelledByUser,
                true,
                &mut actions,
            );
        }
        self.apply_actions(actions);
        Ok(())
    }

    /// Advance the run by `dt_seconds`. Invoked from the controller tick
    /// context after sensor fusion and before the PID stage.
    pub fn tick(&self, dt_seconds: f64) {
        let controller_running = self.controller.is_running();
        let pv = self.controller.process_value();
        let setpoint = self.controller.setpoint();

        let mut actions = TickActions::default();
        {
            let mut state = self.inner.lock().unwrap();
            if !state.running {
                return;
            }

            if !controller_running {
                Self::end_run_locked(
                    &mut state,
                    ProfileEndReason::ControllerStopped,
                    false,
                    &mut actions,
                );
            } else {
                let mut effective_setpoint = setpoint;
                let mut transitions: u32 = 0;
                let mut dt = dt_seconds;
                while state.running {
                    let step_before = state.step_index;
                    let keep_running = Self::execute_step_locked(
                        &mut state,
                        dt,
                        pv,
                        &mut effective_setpoint,
                        &mut transitions,
                        &mut actions,
                    );
                    dt = 0.0;
                    if !keep_running || state.step_index == step_before {
                        break;
                    }
                }
            }
        }
        self.apply_actions(actions);
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    pub fn runtime_status(&self) -> ProfileRuntimeStatus {
        let state = self.inner.lock().unwrap();
        let mut status = ProfileRuntimeStatus {
            running: state.running,
            name: String::new(),
            source: ProfileSource::None.as_str().to_string(),
            slot_index: -1,
            current_step_number: 0,
            current_step_type: "none".to_string(),
            step_elapsed_s: 0.0,
            profile_elapsed_s: 0.0,
            last_end_reason: state.last_end_reason.as_str().to_string(),
        };

        if !state.running {
            return status;
        }

        status.name = state.active.name.clone();
        status.source = state.source.as_str().to_string();
        status.slot_index = state.slot_index;
        status.current_step_number = state.step_index as u32 + 1;
        if let Some(step) = state.active.steps.get(state.step_index) {
            status.current_step_type = step.type_name().to_string();
        }
        status.step_elapsed_s = state.step_elapsed_s;
        status.profile_elapsed_s = state.profile_elapsed_s;
        status
    }

    // ------------------------------------------------------------------
    // Step machine (engine lock held)
    // ------------------------------------------------------------------

    fn enter_step_locked(state: &mut EngineState, step_index: usize, current_setpoint: f64) {
        state.step_index = step_index;
        state.step_elapsed_s = 0.0;
        state.wait_time_latched = false;
        state.wait_pv_latched = false;
        state.soak_accumulated_s = 0.0;
        state.step_start_setpoint_c = current_setpoint;
    }

    /// Reset the repeat counters of jump steps in `[start, end)` so nested
    /// loops re-enter with a full budget after an outer jump.
    fn reset_jump_counters_in_range_locked(state: &mut EngineState, start: usize, end: usize) {
        let end = end.min(state.active.steps.len());
        for index in start..end {
            if let ProfileStep::Jump { repeat_count, .. } = state.active.steps[index] {
                state.jump_remaining.insert(index, repeat_count);
            }
        }
    }

    /// Execute the current step. Returns `false` when the run ended.
    fn execute_step_locked(
        state: &mut EngineState,
        dt_seconds: f64,
        pv: f64,
        effective_setpoint: &mut f64,
        transitions: &mut u32,
        actions: &mut TickActions,
    ) -> bool {
        if state.step_index >= state.active.steps.len() {
            return false;
        }
        let step = state.active.steps[state.step_index].clone();

        let dt = dt_seconds.max(0.0);
        state.step_elapsed_s += dt;
        state.profile_elapsed_s += dt;

        let write_setpoint = |value: f64, actions: &mut TickActions, sp: &mut f64| {
            *sp = value;
            actions.setpoint_writes.push(value);
        };

        let mut advance = false;
        let mut next_step_index = state.step_index + 1;

        match step {
            ProfileStep::Direct { setpoint_c } => {
                write_setpoint(setpoint_c, actions, effective_setpoint);
                advance = true;
            }

            ProfileStep::Wait {
                wait_time_s,
                pv_target_c,
            } => {
                if let Some(wait) = wait_time_s {
                    if !state.wait_time_latched && state.step_elapsed_s >= wait {
                        state.wait_time_latched = true;
                    }
                }
                if let Some(target) = pv_target_c {
                    if !state.wait_pv_latched && (pv - target).abs() <= PV_TOLERANCE_C {
                        state.wait_pv_latched = true;
                    }
                }

                let time_satisfied = wait_time_s.is_none() || state.wait_time_latched;
                let pv_satisfied = pv_target_c.is_none() || state.wait_pv_latched;
                advance = time_satisfied && pv_satisfied;
            }

            ProfileStep::Soak {
                setpoint_c,
                soak_time_s,
                guaranteed,
                deviation_c,
            } => {
                write_setpoint(setpoint_c, actions, effective_setpoint);
                if !guaranteed {
                    state.soak_accumulated_s += dt;
                } else if (pv - setpoint_c).abs() <= deviation_c {
                    state.soak_accumulated_s += dt;
                }
                advance = state.soak_accumulated_s >= soak_time_s;
            }

            ProfileStep::RampTime {
                setpoint_c,
                ramp_time_s,
            } => {
                let duration = ramp_time_s.max(0.001);
                let progress = (state.step_elapsed_s / duration).clamp(0.0, 1.0);
                let value =
                    state.step_start_setpoint_c + (setpoint_c - state.step_start_setpoint_c) * progress;
                write_setpoint(value, actions, effective_setpoint);
                advance = state.step_elapsed_s >= duration;
            }

            ProfileStep::RampRate {
                setpoint_c,
                ramp_rate_c_per_s,
            } => {
                let delta = setpoint_c - state.step_start_setpoint_c;
                let duration = (delta.abs() / ramp_rate_c_per_s.max(0.001)).max(0.001);
                let progress = (state.step_elapsed_s / duration).clamp(0.0, 1.0);
                let value = state.step_start_setpoint_c + delta * progress;
                write_setpoint(value, actions, effective_setpoint);
                advance = state.step_elapsed_s >= duration;
            }

            ProfileStep::Jump {
                target_step_number,
                repeat_count,
            } => {
                let step_index = state.step_index;
                let take_jump = {
                    let remaining = state.jump_remaining.entry(step_index).or_insert(repeat_count);
                    if *remaining > 0 {
                        *remaining -= 1;
                        true
                    } else {
                        // Replenish so the step can re-enter from an outer loop.
                        *remaining = repeat_count;
                        false
                    }
                };
                if take_jump {
                    next_step_index = (target_step_number - 1).max(0) as usize;
                    Self::reset_jump_counters_in_range_locked(state, next_step_index, step_index);
                }
                advance = true;
            }
        }

        if !advance {
            return true;
        }

        *transitions += 1;
        if *transitions > MAX_TRANSITIONS_PER_TICK {
            warn!(
                "profile transition guard tripped after {} transitions",
                transitions
            );
            Self::end_run_locked(state, ProfileEndReason::TransitionGuard, true, actions);
            return false;
        }

        if next_step_index >= state.active.steps.len() {
            Self::end_run_locked(state, ProfileEndReason::Completed, true, actions);
            return false;
        }

        Self::enter_step_locked(state, next_step_index, *effective_setpoint);
        true
    }

    fn end_run_locked(
        state: &mut EngineState,
        reason: ProfileEndReason,
        stop_controller: bool,
        actions: &mut TickActions,
    ) {
        let was_running = state.running;
        state.running = false;
        state.last_end_reason = reason;

        state.active.steps.clear();
        state.active.name.clear();
        state.source = ProfileSource::None;
        state.slot_index = -1;
        state.step_index = 0;
        state.step_elapsed_s = 0.0;
        state.profile_elapsed_s = 0.0;
        state.step_start_setpoint_c = 0.0;
        state.wait_time_latched = false;
        state.wait_pv_latched = false;
        state.soak_accumulated_s = 0.0;
        state.jump_remaining.clear();

        actions.clear_lock = true;
        actions.stop_controller = stop_controller && was_running;

        info!("profile run ended: {}", reason.as_str());
    }

    fn apply_actions(&self, actions: TickActions) {
        for setpoint in actions.setpoint_writes {
            if let Err(err) = self.controller.set_setpoint_from_profile(setpoint) {
                warn!("profile setpoint write rejected: {}", err);
            }
        }
        if actions.clear_lock {
            self.controller.set_profile_setpoint_lock(false);
        }
        if actions.stop_controller && self.controller.is_running() {
            if let Err(err) = self.controller.stop() {
                warn!("controller stop at end of profile failed: {}", err);
            }
        }
    }
}
