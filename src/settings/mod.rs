// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Persistent key-value settings store
//!
//! A flat string→JSON map backed by a single file, standing in for the
//! original NVS partition. Semantics required by the control core:
//!
//! - missing file or missing key: the caller's default applies;
//! - corrupted file: log, wipe, continue from defaults;
//! - failed write: surfaced to the caller as `IoFailed` (the in-memory
//!   value keeps the new state, matching the write-last discipline of the
//!   controller setters).
//!
//! Keys are kept to 15 characters or fewer so the layout stays portable to
//! NVS-style stores with short key limits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use log::{debug, warn};
use serde_json::Value;

use crate::control::error::{ControlError, ControlResult};

// Controller tuning keys.
pub const KEY_KP_HEAT: &str = "kp_heat";
pub const KEY_KI_HEAT: &str = "ki_heat";
pub const KEY_KD_HEAT: &str = "kd_heat";
pub const KEY_KP_COOL: &str = "kp_cool";
pub const KEY_KI_COOL: &str = "ki_cool";
pub const KEY_KD_COOL: &str = "kd_cool";
pub const KEY_SETPOINT_WEIGHT: &str = "sp_weight";
pub const KEY_DERIVATIVE_FILTER: &str = "d_filter_s";
pub const KEY_INTEGRATOR_ZONE: &str = "i_zone_c";
pub const KEY_INTEGRATOR_LEAK: &str = "i_leak_s";
pub const KEY_INPUT_FILTER_MS: &str = "in_filter_ms";
pub const KEY_INPUTS_MASK: &str = "inputs_mask";
pub const KEY_PWM_RELAY_MASK: &str = "pwm_mask";
pub const KEY_PWM_RELAY_WEIGHTS: &str = "pwm_weights";
pub const KEY_RELAYS_ON_MASK: &str = "relays_on_mask";
pub const KEY_DOOR_CLOSED_DEG: &str = "door_closed";
pub const KEY_DOOR_OPEN_DEG: &str = "door_open";
pub const KEY_DOOR_SPEED: &str = "door_speed";

/// File-backed settings store.
pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl SettingsStore {
    /// Open (or create) the store at `path`. A corrupted file is wiped and
    /// replaced with an empty store so the system always boots.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, Value>>(&contents) {
                Ok(map) => map,
                Err(err) => {
                    warn!(
                        "settings file {:?} is corrupted ({}), wiping and using defaults",
                        path, err
                    );
                    if let Err(err) = fs::write(&path, "{}\n")
                        .with_context(|| format!("Failed to reset settings file at {:?}", path))
                    {
                        warn!("{:#}", err);
                    }
                    BTreeMap::new()
                }
            },
            Err(_) => {
                debug!("settings file {:?} not found, starting from defaults", path);
                BTreeMap::new()
            }
        };

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> ControlResult<()> {
        self.write_file(values)
            .map_err(|err| ControlError::IoFailed(format!("{:#}", err)))
    }

    fn write_file(&self, values: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        let serialized = serde_json::to_string_pretty(values)
            .context("Failed to serialize settings to JSON")?;
        fs::write(&self.path, serialized + "\n")
            .with_context(|| format!("Failed to write settings to {:?}", self.path))?;
        Ok(())
    }

    fn set(&self, key: &str, value: Value) -> ControlResult<()> {
        debug_assert!(key.len() <= 15, "settings key too long: {}", key);
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().unwrap().contains_key(key)
    }

    /// Remove `key`; returns whether it existed.
    pub fn remove(&self, key: &str) -> ControlResult<bool> {
        let mut values = self.values.lock().unwrap();
        let existed = values.remove(key).is_some();
        if existed {
            self.persist(&values)?;
        }
        Ok(existed)
    }

    pub fn set_f64(&self, key: &str, value: f64) -> ControlResult<()> {
        let number = serde_json::Number::from_f64(value).ok_or_else(|| {
            ControlError::InvalidArgument(format!("{} must be a finite number", key))
        })?;
        self.set(key, Value::Number(number))
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn set_u64(&self, key: &str, value: u64) -> ControlResult<()> {
        self.set(key, Value::Number(value.into()))
    }

    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn set_string(&self, key: &str, value: &str) -> ControlResult<()> {
        self.set(key, Value::String(value.to_string()))
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    /// Persist the 8-wide relay weight table.
    pub fn set_relay_weights(&self, weights: &[f64; 8]) -> ControlResult<()> {
        let array = weights
            .iter()
            .map(|w| {
                serde_json::Number::from_f64(w.clamp(0.0, 1.0))
                    .map(Value::Number)
                    .ok_or_else(|| {
                        ControlError::InvalidArgument("relay weight must be finite".into())
                    })
            })
            .collect::<ControlResult<Vec<_>>>()?;
        self.set(KEY_PWM_RELAY_WEIGHTS, Value::Array(array))
    }

    /// Stored relay weight table, defaulting missing entries to 1.0.
    pub fn relay_weights(&self) -> [f64; 8] {
        let mut weights = [1.0; 8];
        if let Some(Value::Array(items)) = self.get(KEY_PWM_RELAY_WEIGHTS) {
            for (slot, item) in weights.iter_mut().zip(items.iter()) {
                if let Some(value) = item.as_f64() {
                    *slot = value.clamp(0.0, 1.0);
                }
            }
        }
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SettingsStore {
        SettingsStore::open(dir.path().join("settings.json"))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.f64_or(KEY_KP_HEAT, 2.5), 2.5);
        assert!(!store.contains(KEY_KP_HEAT));
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_in(&dir);
            store.set_f64(KEY_KP_HEAT, 12.5).unwrap();
            store.set_u64(KEY_INPUTS_MASK, 0b101).unwrap();
            store.set_string("slot0_name", "lead-free").unwrap();
        }
        let store = store_in(&dir);
        assert_eq!(store.f64_or(KEY_KP_HEAT, 0.0), 12.5);
        assert_eq!(store.u64_or(KEY_INPUTS_MASK, 0), 0b101);
        assert_eq!(store.string("slot0_name").as_deref(), Some("lead-free"));
    }

    #[test]
    fn test_corrupted_file_is_wiped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json !").unwrap();

        let store = SettingsStore::open(&path);
        assert_eq!(store.f64_or(KEY_KP_HEAT, 7.0), 7.0);

        // The wipe leaves a loadable empty store behind.
        let reopened = SettingsStore::open(&path);
        assert!(!reopened.contains(KEY_KP_HEAT));
    }

    #[test]
    fn test_remove_reports_existence() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set_f64(KEY_DOOR_SPEED, 90.0).unwrap();
        assert!(store.remove(KEY_DOOR_SPEED).unwrap());
        assert!(!store.remove(KEY_DOOR_SPEED).unwrap());
        assert_eq!(store.f64_or(KEY_DOOR_SPEED, 60.0), 60.0);
    }

    #[test]
    fn test_relay_weight_table_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.relay_weights(), [1.0; 8]);

        let weights = [1.0, 0.5, 0.0, 0.25, 1.0, 1.0, 0.75, 0.1];
        store.set_relay_weights(&weights).unwrap();
        assert_eq!(store.relay_weights(), weights);
    }

    #[test]
    fn test_non_finite_value_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.set_f64(KEY_KP_HEAT, f64::NAN).is_err());
        assert!(!store.contains(KEY_KP_HEAT));
    }
}
