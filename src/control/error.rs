// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Error taxonomy shared by the control core
//!
//! Setter-style operations fail fast with one of these variants and leave
//! state unchanged; tick-level sensor failures surface as [`ControlError::SensorError`]
//! and drive the controller into its alarm state instead of aborting the loop.

use thiserror::Error;

/// Errors produced by the controller, profile engine, settings store and
/// hardware layer.
#[derive(Debug, Error)]
pub enum ControlError {
    /// A setter received an out-of-range or malformed value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the current state (start while running,
    /// stop while idle, door command while running, ...).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The referenced entity does not exist (empty profile slot, no uploaded
    /// profile).
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation collides with existing state (occupied slot on save,
    /// external setpoint write while a profile holds the setpoint lock).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A hardware or storage operation failed.
    #[error("i/o failed: {0}")]
    IoFailed(String),

    /// The profile engine exceeded its per-tick transition budget.
    #[error("transition guard tripped after {0} transitions in one tick")]
    TransitionGuard(u32),

    /// Every enabled thermocouple channel returned the error sentinel.
    #[error("all enabled sensor channels failed")]
    SensorError,
}

/// Convenience alias used throughout the control core.
pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    /// Short stable tag for telemetry and log filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::InvalidArgument(_) => "invalid_argument",
            ControlError::InvalidState(_) => "invalid_state",
            ControlError::NotFound(_) => "not_found",
            ControlError::Conflict(_) => "conflict",
            ControlError::IoFailed(_) => "io_failed",
            ControlError::TransitionGuard(_) => "transition_guard",
            ControlError::SensorError => "sensor_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(
            ControlError::InvalidArgument("x".into()).kind(),
            "invalid_argument"
        );
        assert_eq!(ControlError::SensorError.kind(), "sensor_error");
        assert_eq!(ControlError::TransitionGuard(257).kind(), "transition_guard");
    }

    #[test]
    fn test_error_display_contains_detail() {
        let err = ControlError::Conflict("slot 2 occupied".into());
        assert!(err.to_string().contains("slot 2 occupied"));
    }
}
