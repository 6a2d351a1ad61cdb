// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Daemon task manager
//!
//! Wires the control core together and runs its background services:
//!
//! * **sensor reader** — polls the thermocouples (~220 ms) into the shared
//!   [`SensorBank`]; the only writer of that surface;
//! * **control loop** — fixed-period tick: sensor fusion + alarm evaluation,
//!   then the profile engine, then PID + actuator dispatch;
//! * **telemetry recorder** — samples a [`DataPoint`] into the shared
//!   history ring at the configured interval;
//! * **heartbeat** — periodic debug line with the controller state.
//!
//! All tasks watch a shared atomic running flag; `shutdown()` flips it and
//! `join()` waits for the tasks with a timeout.

use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::Config;
use crate::control::telemetry::{unix_timestamp_s, DataPoint};
use crate::control::{
    create_shared_history, Controller, ProfileEngine, SensorBank, SharedControlHistory,
    SystemClock,
};
use crate::hardware::{create_hardware_driver, HardwareDriver};
use crate::settings::SettingsStore;

/// Background service coordinator for the oven controller.
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
    config: Arc<RwLock<Config>>,
    hardware: Option<Arc<dyn HardwareDriver>>,
    sensors: Arc<SensorBank>,
    controller: Option<Arc<Controller>>,
    profile_engine: Option<Arc<ProfileEngine>>,
    history: SharedControlHistory,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Create a daemon with no tasks launched yet.
    pub fn new() -> Self {
        Daemon {
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            config: Arc::new(RwLock::new(Config::default())),
            hardware: None,
            sensors: Arc::new(SensorBank::new()),
            controller: None,
            profile_engine: None,
            history: create_shared_history(1),
        }
    }

    /// Build the control core from the configuration and start all
    /// background tasks.
    pub async fn launch(&mut self, config: Arc<RwLock<Config>>) -> Result<()> {
        self.config = config;
        let config_snapshot = self.config.read().await.clone();

        let settings = Arc::new(SettingsStore::open(&config_snapshot.settings_file));
        let hardware = create_hardware_driver(&config_snapshot.hardware)?;
        self.hardware = Some(hardware.clone());
        self.history = create_shared_history(config_snapshot.telemetry.max_points);

        let controller = Controller::new(
            &config_snapshot.controller,
            hardware.clone(),
            self.sensors.clone(),
            settings.clone(),
            Arc::new(SystemClock::new()),
        );
        let profile_engine = Arc::new(ProfileEngine::new(controller.clone(), settings));
        self.controller = Some(controller);
        self.profile_engine = Some(profile_engine);

        self.start_sensor_reader(&config_snapshot)?;
        self.start_control_loop(&config_snapshot)?;
        if config_snapshot.telemetry.enabled {
            self.start_telemetry_recorder(&config_snapshot)?;
        }
        self.start_heartbeat()?;

        info!(
            "daemon launched: tick {} ms, sensor poll {} ms, telemetry {}",
            config_snapshot.controller.tick_interval_ms,
            config_snapshot.hardware.sensor_poll_ms,
            if config_snapshot.telemetry.enabled {
                "on"
            } else {
                "off"
            }
        );
        Ok(())
    }

    /// Single writer of the sensor bank: polls every thermocouple channel
    /// and publishes the last-known values.
    fn start_sensor_reader(&mut self, config: &Config) -> Result<()> {
        let hardware = self
            .hardware
            .clone()
            .ok_or_else(|| anyhow::anyhow!("hardware driver not initialized"))?;
        let sensors = self.sensors.clone();
        let running = self.running.clone();
        let poll_interval = Duration::from_millis(config.hardware.sensor_poll_ms);
        let channels = config.hardware.thermocouple_channels as usize;

        let task = tokio::spawn(async move {
            info!("sensor reader started ({} channels)", channels);
            while running.load(Ordering::SeqCst) {
                for channel in 0..channels {
                    sensors.store(channel, hardware.read_thermocouple(channel));
                }
                time::sleep(poll_interval).await;
            }
            info!("sensor reader stopped");
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// The fixed-period regulation loop. Order within a tick is strict:
    /// sensor fusion, profile engine, PID + dispatch.
    fn start_control_loop(&mut self, config: &Config) -> Result<()> {
        let controller = self
            .controller
            .clone()
            .ok_or_else(|| anyhow::anyhow!("controller not initialized"))?;
        let profile_engine = self
            .profile_engine
            .clone()
            .ok_or_else(|| anyhow::anyhow!("profile engine not initialized"))?;
        let running = self.running.clone();
        let tick_ms = config.controller.tick_interval_ms;
        let dt_seconds = tick_ms as f64 / 1000.0;

        let task = tokio::spawn(async move {
            info!("control loop started ({} ms tick)", tick_ms);
            let mut interval = time::interval(Duration::from_millis(tick_ms));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            while running.load(Ordering::SeqCst) {
                interval.tick().await;

                match controller.prepare_tick() {
                    Ok(()) => {
                        profile_engine.tick(dt_seconds);
                        controller.regulate_tick();
                    }
                    Err(err) => {
                        // The controller has already alarmed and stopped;
                        // the profile engine winds down on its next tick.
                        debug!("sensor phase failed: {}", err);
                        profile_engine.tick(dt_seconds);
                    }
                }
            }

            info!("control loop stopped");
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Periodically samples controller + hardware state into the shared
    /// history ring.
    fn start_telemetry_recorder(&mut self, config: &Config) -> Result<()> {
        let controller = self
            .controller
            .clone()
            .ok_or_else(|| anyhow::anyhow!("controller not initialized"))?;
        let hardware = self
            .hardware
            .clone()
            .ok_or_else(|| anyhow::anyhow!("hardware driver not initialized"))?;
        let sensors = self.sensors.clone();
        let history = self.history.clone();
        let running = self.running.clone();
        let interval_ms = config.telemetry.log_interval_ms.clamp(250, 10_000);

        let task = tokio::spawn(async move {
            info!("telemetry recorder started ({} ms interval)", interval_ms);
            let mut interval = time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            while running.load(Ordering::SeqCst) {
                interval.tick().await;

                let snapshot = controller.snapshot();
                let temps = sensors.snapshot();
                let point = DataPoint {
                    timestamp_s: unix_timestamp_s(),
                    setpoint: snapshot.setpoint_c as f32,
                    pv: snapshot.process_value_c as f32,
                    pid_output: snapshot.pid_output as f32,
                    p_term: snapshot.terms.proportional as f32,
                    i_term: snapshot.terms.integral as f32,
                    d_term: snapshot.terms.derivative as f32,
                    temps: [
                        temps[0] as f32,
                        temps[1] as f32,
                        temps[2] as f32,
                        temps[3] as f32,
                    ],
                    relay_bitmask: hardware.relay_bitmask(),
                    servo_angle: hardware.servo_angle().clamp(0.0, 180.0).round() as u8,
                    running: snapshot.running,
                };
                history.write().await.record(point);
            }

            info!("telemetry recorder stopped");
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Periodic debug line for health monitoring.
    fn start_heartbeat(&mut self) -> Result<()> {
        let running = self.running.clone();
        let controller = self.controller.clone();

        let task = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                if let Some(ref controller) = controller {
                    debug!("daemon heartbeat: {}", controller.describe());
                } else {
                    debug!("daemon heartbeat: running");
                }
                time::sleep(Duration::from_secs(60)).await;
            }
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// The controller, once launched.
    pub fn controller(&self) -> Option<Arc<Controller>> {
        self.controller.clone()
    }

    /// The profile engine, once launched.
    pub fn profile_engine(&self) -> Option<Arc<ProfileEngine>> {
        self.profile_engine.clone()
    }

    /// Shared telemetry history.
    pub fn history(&self) -> SharedControlHistory {
        self.history.clone()
    }

    /// Shared sensor bank.
    pub fn sensors(&self) -> Arc<SensorBank> {
        self.sensors.clone()
    }

    /// Signal every task to terminate. Does not wait; call `join()` next.
    pub fn shutdown(&self) {
        info!("shutting down daemon tasks");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wind the system down: end a running profile, stop the controller,
    /// then wait for the background tasks with a timeout.
    pub async fn join(mut self) -> Result<()> {
        if let Some(ref engine) = self.profile_engine {
            if engine.is_running() {
                info!("cancelling running profile for shutdown");
                if let Err(err) = engine.cancel_running() {
                    warn!("profile cancel at shutdown failed: {}", err);
                }
            }
        }

        if let Some(ref controller) = self.controller {
            if controller.is_running() {
                info!("stopping controller for shutdown");
                if let Err(err) = controller.stop() {
                    error!("controller stop at shutdown failed: {}", err);
                }
            }
        }

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(result) => {
                    if let Err(err) = result {
                        error!("task panicked: {}", err);
                    }
                }
                Err(_) => {
                    warn!("task did not complete within timeout period, may be hung");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.settings_file = dir
            .path()
            .join("settings.json")
            .to_string_lossy()
            .to_string();
        config.controller.tick_interval_ms = 50;
        config.hardware.sensor_poll_ms = 20;
        config.hardware.mock.sensor_noise_c = 0.0;
        config.telemetry.log_interval_ms = 250;
        config
    }

    #[tokio::test]
    async fn test_launch_wires_the_core() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(RwLock::new(test_config(&dir)));

        let mut daemon = Daemon::new();
        daemon.launch(config).await.unwrap();
        assert!(daemon.controller().is_some());
        assert!(daemon.profile_engine().is_some());

        // Give the sensor reader and control loop a few periods.
        time::sleep(Duration::from_millis(300)).await;

        // The mock plant idles near ambient; the fused PV follows it.
        let controller = daemon.controller().unwrap();
        let pv = controller.process_value();
        assert!((20.0..30.0).contains(&pv), "pv = {}", pv);
        assert!(!controller.is_alarming());

        daemon.shutdown();
        daemon.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_telemetry_recorder_fills_history() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(RwLock::new(test_config(&dir)));

        let mut daemon = Daemon::new();
        daemon.launch(config).await.unwrap();
        let history = daemon.history();

        time::sleep(Duration::from_millis(700)).await;
        let recorded = history.read().await.len();
        assert!(recorded >= 2, "only {} telemetry points", recorded);

        let recent = history.read().await.recent(1);
        assert!(!recent[0].running);
        assert!((recent[0].pv - 24.0).abs() < 5.0);

        daemon.shutdown();
        daemon.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_terminates_tasks() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(RwLock::new(test_config(&dir)));

        let mut daemon = Daemon::new();
        daemon.launch(config).await.unwrap();
        daemon.shutdown();
        // join() returning without hitting the per-task timeout is the
        // assertion here.
        daemon.join().await.unwrap();
    }
}
