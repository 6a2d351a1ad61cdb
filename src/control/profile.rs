// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Profile definitions
//!
//! A profile scripts the setpoint over time as a list of steps. The wire
//! form is JSON with a `"type"` tag per step; step numbers in jump targets
//! are 1-based. Validation is total: a profile that passes
//! [`ProfileDefinition::validate`] cannot fail structurally at runtime.

use serde::{Deserialize, Serialize};

/// Bounds shared with the controller's setpoint range.
pub const MIN_PROFILE_SETPOINT_C: f64 = 0.0;
pub const MAX_PROFILE_SETPOINT_C: f64 = 300.0;

/// Acceptance band for `wait` steps targeting a process value.
pub const PV_TOLERANCE_C: f64 = 1.0;

/// Profiles may hold at most this many steps.
pub const MAX_STEPS: usize = 40;

/// Current wire schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// One profile step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileStep {
    /// Write the setpoint and advance immediately.
    Direct { setpoint_c: f64 },

    /// Hold until the elapsed time and/or the process value condition has
    /// latched. At least one condition must be present.
    Wait {
        #[serde(skip_serializing_if = "Option::is_none")]
        wait_time_s: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pv_target_c: Option<f64>,
    },

    /// Hold the setpoint for an accumulated duration. A guaranteed soak
    /// only counts time while the process value stays within
    /// `deviation_c` of the setpoint.
    Soak {
        setpoint_c: f64,
        soak_time_s: f64,
        #[serde(default)]
        guaranteed: bool,
        #[serde(default)]
        deviation_c: f64,
    },

    /// Ramp linearly from the current setpoint to the target over a fixed
    /// duration.
    RampTime { setpoint_c: f64, ramp_time_s: f64 },

    /// Ramp linearly from the current setpoint to the target at a fixed
    /// rate.
    RampRate {
        setpoint_c: f64,
        ramp_rate_c_per_s: f64,
    },

    /// Jump backward to `target_step_number` (1-based) while repeats
    /// remain, then fall through.
    Jump {
        target_step_number: i64,
        repeat_count: i64,
    },
}

impl ProfileStep {
    /// Wire name of the step type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ProfileStep::Direct { .. } => "direct",
            ProfileStep::Wait { .. } => "wait",
            ProfileStep::Soak { .. } => "soak",
            ProfileStep::RampTime { .. } => "ramp_time",
            ProfileStep::RampRate { .. } => "ramp_rate",
            ProfileStep::Jump { .. } => "jump",
        }
    }
}

/// A named sequence of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDefinition {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<ProfileStep>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// One validation finding. `step_index` is -1 for profile-level problems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileValidationError {
    pub step_index: i32,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ProfileValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.step_index < 0 {
            write!(f, "{}: {}", self.field, self.message)
        } else {
            write!(
                f,
                "step {} {}: {}",
                self.step_index + 1,
                self.field,
                self.message
            )
        }
    }
}

fn push_error(
    errors: &mut Vec<ProfileValidationError>,
    step_index: i32,
    field: &str,
    message: &str,
) {
    errors.push(ProfileValidationError {
        step_index,
        field: field.to_string(),
        message: message.to_string(),
    });
}

fn setpoint_in_range(setpoint_c: f64) -> bool {
    setpoint_c.is_finite()
        && (MIN_PROFILE_SETPOINT_C..=MAX_PROFILE_SETPOINT_C).contains(&setpoint_c)
}

impl ProfileDefinition {
    /// Validate the profile. An empty result means the profile can run.
    pub fn validate(&self) -> Vec<ProfileValidationError> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            push_error(&mut errors, -1, "name", "name is required");
        }

        if self.steps.is_empty() {
            push_error(&mut errors, -1, "steps", "steps must not be empty");
            return errors;
        }
        if self.steps.len() > MAX_STEPS {
            push_error(&mut errors, -1, "steps", "too many steps");
        }

        let step_count = self.steps.len() as i64;
        for (index, step) in self.steps.iter().enumerate() {
            let step_index = index as i32;
            match step {
                ProfileStep::Direct { setpoint_c } => {
                    if !setpoint_in_range(*setpoint_c) {
                        push_error(
                            &mut errors,
                            step_index,
                            "setpoint_c",
                            "direct setpoint must be within [0,300]",
                        );
                    }
                }

                ProfileStep::Wait {
                    wait_time_s,
                    pv_target_c,
                } => {
                    if wait_time_s.is_none() && pv_target_c.is_none() {
                        push_error(
                            &mut errors,
                            step_index,
                            "wait",
                            "wait requires wait_time_s and/or pv_target_c",
                        );
                    }
                    if let Some(wait) = wait_time_s {
                        if !wait.is_finite() || *wait <= 0.0 {
                            push_error(
                                &mut errors,
                                step_index,
                                "wait_time_s",
                                "wait_time_s must be > 0",
                            );
                        }
                    }
                    if let Some(target) = pv_target_c {
                        if !target.is_finite() {
                            push_error(
                                &mut errors,
                                step_index,
                                "pv_target_c",
                                "pv_target_c must be finite",
                            );
                        }
                    }
                }

                ProfileStep::Soak {
                    setpoint_c,
                    soak_time_s,
                    guaranteed,
                    deviation_c,
                } => {
                    if !setpoint_in_range(*setpoint_c) {
                        push_error(
                            &mut errors,
                            step_index,
                            "setpoint_c",
                            "soak setpoint must be within [0,300]",
                        );
                    }
                    if !soak_time_s.is_finite() || *soak_time_s <= 0.0 {
                        push_error(
                            &mut errors,
                            step_index,
                            "soak_time_s",
                            "soak_time_s must be > 0",
                        );
                    }
                    if *guaranteed && (!deviation_c.is_finite() || *deviation_c <= 0.0) {
                        push_error(
                            &mut errors,
                            step_index,
                            "deviation_c",
                            "deviation_c must be > 0 when guaranteed is true",
                        );
                    }
                }

                ProfileStep::RampTime {
                    setpoint_c,
                    ramp_time_s,
                } => {
                    if !setpoint_in_range(*setpoint_c) {
                        push_error(
                            &mut errors,
                            step_index,
                            "setpoint_c",
                            "ramp_time setpoint must be within [0,300]",
                        );
                    }
                    if !ramp_time_s.is_finite() || *ramp_time_s <= 0.0 {
                        push_error(
                            &mut errors,
                            step_index,
                            "ramp_time_s",
                            "ramp_time_s must be > 0",
                        );
                    }
                }

                ProfileStep::RampRate {
                    setpoint_c,
                    ramp_rate_c_per_s,
                } => {
                    if !setpoint_in_range(*setpoint_c) {
                        push_error(
                            &mut errors,
                            step_index,
                            "setpoint_c",
                            "ramp_rate setpoint must be within [0,300]",
                        );
                    }
                    if !ramp_rate_c_per_s.is_finite() || *ramp_rate_c_per_s <= 0.0 {
                        push_error(
                            &mut errors,
                            step_index,
                            "ramp_rate_c_per_s",
                            "ramp_rate_c_per_s must be > 0",
                        );
                    }
                }

                ProfileStep::Jump {
                    target_step_number,
                    repeat_count,
                } => {
                    if *target_step_number < 1 || *target_step_number > step_count {
                        push_error(
                            &mut errors,
                            step_index,
                            "target_step_number",
                            "target_step_number out of range",
                        );
                    } else if *target_step_number >= (index as i64 + 1) {
                        push_error(
                            &mut errors,
                            step_index,
                            "target_step_number",
                            "jump target must be backward",
                        );
                    }
                    if *repeat_count < 0 {
                        push_error(
                            &mut errors,
                            step_index,
                            "repeat_count",
                            "repeat_count must be >= 0",
                        );
                    }
                }
            }
        }

        errors
    }

    /// Parse and validate a JSON profile.
    pub fn from_json(json: &str) -> Result<Self, Vec<ProfileValidationError>> {
        let parsed: ProfileDefinition = serde_json::from_str(json).map_err(|err| {
            vec![ProfileValidationError {
                step_index: -1,
                field: "json".to_string(),
                message: err.to_string(),
            }]
        })?;
        let errors = parsed.validate();
        if errors.is_empty() {
            Ok(parsed)
        } else {
            Err(errors)
        }
    }

    /// Serialize to the compact wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
