// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Control core: regulation loop, PID, slow PWM, profiles and telemetry
//!
//! Data flow per tick (250 ms nominal): the sensor bank is fused into a
//! filtered process value, the profile engine may rewrite the setpoint, the
//! PID turns setpoint and process value into a signed output, and the
//! dispatcher splits that output between the heating relays (positive, via
//! slow PWM) and the vent servo (negative, rate limited).

pub mod clock;
pub mod controller;
pub mod error;
pub mod pid;
pub mod profile;
pub mod profile_engine;
pub mod sensor;
pub mod slow_pwm;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{Controller, ControllerSnapshot};
pub use error::{ControlError, ControlResult};
pub use pid::{PidController, PidGains, PidTerms};
pub use profile::{ProfileDefinition, ProfileStep, ProfileValidationError};
pub use profile_engine::{ProfileEndReason, ProfileEngine, ProfileRuntimeStatus};
pub use sensor::SensorBank;
pub use slow_pwm::{PwmSink, SlowPwm};
pub use telemetry::{create_shared_history, ControlHistory, DataPoint, SharedControlHistory};
