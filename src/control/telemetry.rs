// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Control history for telemetry
//!
//! A bounded ring of fixed-size [`DataPoint`] records written by the
//! daemon's recorder task and read by whatever external surface wants them
//! (CSV export, live charts). The ring is shared as
//! `Arc<tokio::sync::RwLock<ControlHistory>>`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One telemetry record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataPoint {
    /// Unix timestamp in seconds.
    pub timestamp_s: u64,
    /// Setpoint in °C.
    pub setpoint: f32,
    /// Filtered process value in °C.
    pub pv: f32,
    /// Signed PID output in [-100, 100].
    pub pid_output: f32,
    /// Proportional term of the last PID step.
    pub p_term: f32,
    /// Integral term of the last PID step.
    pub i_term: f32,
    /// Derivative term of the last PID step.
    pub d_term: f32,
    /// Raw readings of the first four thermocouple channels.
    pub temps: [f32; 4],
    /// Relay states, bit n = relay n.
    pub relay_bitmask: u8,
    /// Vent servo angle in degrees.
    pub servo_angle: u8,
    /// Whether the controller was running.
    pub running: bool,
}

/// Bounded history ring.
pub struct ControlHistory {
    capacity: usize,
    points: VecDeque<DataPoint>,
}

impl ControlHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            points: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a record, dropping the oldest when full.
    pub fn record(&mut self, point: DataPoint) {
        self.points.push_back(point);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recent `count` records, oldest first.
    pub fn recent(&self, count: usize) -> Vec<DataPoint> {
        let start = self.points.len().saturating_sub(count);
        self.points.range(start..).copied().collect()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Render the whole ring as CSV, header included.
    pub fn to_csv(&self) -> String {
        let mut csv = String::with_capacity(64 + self.points.len() * 96);
        csv.push_str(
            "timestamp_s,setpoint,pv,pid_output,p_term,i_term,d_term,\
             temp0,temp1,temp2,temp3,relay_bitmask,servo_angle,running\n",
        );
        for point in &self.points {
            csv.push_str(&format!(
                "{},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{},{},{}\n",
                point.timestamp_s,
                point.setpoint,
                point.pv,
                point.pid_output,
                point.p_term,
                point.i_term,
                point.d_term,
                point.temps[0],
                point.temps[1],
                point.temps[2],
                point.temps[3],
                point.relay_bitmask,
                point.servo_angle,
                if point.running { 1 } else { 0 },
            ));
        }
        csv
    }
}

/// Shared history handle used across daemon tasks.
pub type SharedControlHistory = Arc<RwLock<ControlHistory>>;

pub fn create_shared_history(capacity: usize) -> SharedControlHistory {
    Arc::new(RwLock::new(ControlHistory::new(capacity)))
}

/// Current Unix timestamp in seconds.
pub fn unix_timestamp_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
