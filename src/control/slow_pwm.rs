// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the reflowd project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Soft PWM edge scheduler
//!
//! Time-proportional switching with a period in the seconds range, meant for
//! mechanical relays rather than electronic switches. The scheduler owns a
//! dedicated tokio task that alternates between the ON and OFF segments of
//! each period and fires the matching [`PwmSink`] callback at every edge.
//!
//! Duty changes take effect at the next edge; the in-flight segment finishes
//! with the durations it was scheduled with. `force_on`/`force_off` fire the
//! corresponding callback immediately on the caller and, when running,
//! reschedule the next edge from "now". Edge jitter below the OS timer
//! resolution is not guaranteed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::ControlResult;

/// Callbacks fired on PWM edges. Implementations must be cheap: they run
/// serially on the timer task.
pub trait PwmSink: Send + Sync {
    fn on_high(&self);
    fn on_low(&self);
}

enum PwmCommand {
    /// Recompute the next edge from "now" (state was changed externally).
    Resync,
    Stop,
}

struct PwmShared {
    period_ms: u64,
    duty: f64,
    is_on: bool,
    running: bool,
}

/// Slow software PWM driving a [`PwmSink`].
pub struct SlowPwm {
    shared: Arc<Mutex<PwmShared>>,
    sink: Arc<dyn PwmSink>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<PwmCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// ON/OFF segment lengths for a period and duty. Any zero-length segment is
/// raised to 1 ms so duty 0 or 1 cannot produce a busy edge schedule.
fn segment_durations(period_ms: u64, duty: f64) -> (u64, u64) {
    let on = ((period_ms as f64) * duty + 0.5) as u64;
    let on = on.min(period_ms);
    (on, period_ms - on)
}

impl SlowPwm {
    /// Create a scheduler with the given period (ms) and initial duty in
    /// [0, 1]. The PWM is created stopped and in the OFF state.
    pub fn new(period_ms: u64, duty: f64, sink: Arc<dyn PwmSink>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(PwmShared {
                period_ms: period_ms.max(1),
                duty: duty.clamp(0.0, 1.0),
                is_on: false,
                running: false,
            })),
            sink,
            command_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Arm the scheduler. Starts in the OFF state; the first edge fires
    /// after the OFF segment without invoking `on_low` at start time.
    /// Idempotent while running. Must be called from within a tokio runtime.
    pub fn start(&self) -> ControlResult<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.running {
                return Ok(());
            }
            shared.running = true;
            shared.is_on = false;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.command_tx.lock().unwrap() = Some(tx);

        let shared = self.shared.clone();
        let sink = self.sink.clone();
        let handle = tokio::spawn(Self::run_edges(shared, sink, rx));
        *self.task.lock().unwrap() = Some(handle);

        debug!("slow PWM armed");
        Ok(())
    }

    /// Cancel the scheduler. No further edges fire after this returns; the
    /// output state is left as-is (callers force relays off themselves).
    pub fn stop(&self) -> ControlResult<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            if !shared.running {
                return Ok(());
            }
            shared.running = false;
        }

        if let Some(tx) = self.command_tx.lock().unwrap().take() {
            let _ = tx.send(PwmCommand::Stop);
        }
        self.task.lock().unwrap().take();

        debug!("slow PWM stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().unwrap().running
    }

    /// Update the duty cycle (clamped to [0, 1]); applied at the next edge.
    pub fn set_duty_cycle(&self, duty: f64) {
        let mut shared = self.shared.lock().unwrap();
        shared.duty = if duty.is_finite() {
            duty.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    pub fn duty_cycle(&self) -> f64 {
        self.shared.lock().unwrap().duty
    }

    /// Update the period (min 1 ms); applied at the next edge.
    pub fn set_period_ms(&self, period_ms: u64) {
        self.shared.lock().unwrap().period_ms = period_ms.max(1);
    }

    pub fn period_ms(&self) -> u64 {
        self.shared.lock().unwrap().period_ms
    }

    /// Force the ON state, firing `on_high` immediately when the state
    /// changes. If running, the next edge is rescheduled from now.
    pub fn force_on(&self) {
        let changed = {
            let mut shared = self.shared.lock().unwrap();
            let changed = !shared.is_on;
            shared.is_on = true;
            changed
        };
        if changed {
            self.sink.on_high();
        }
        self.resync();
    }

    /// Force the OFF state, firing `on_low` immediately when the state
    /// changes. If running, the next edge is rescheduled from now.
    pub fn force_off(&self) {
        let changed = {
            let mut shared = self.shared.lock().unwrap();
            let changed = shared.is_on;
            shared.is_on = false;
            changed
        };
        if changed {
            self.sink.on_low();
        }
        self.resync();
    }

    fn resync(&self) {
        if let Some(tx) = self.command_tx.lock().unwrap().as_ref() {
            let _ = tx.send(PwmCommand::Resync);
        }
    }

    async fn run_edges(
        shared: Arc<Mutex<PwmShared>>,
        sink: Arc<dyn PwmSink>,
        mut commands: mpsc::UnboundedReceiver<PwmCommand>,
    ) {
        loop {
            let delay_ms = {
                let guard = shared.lock().unwrap();
                if !guard.running {
                    break;
                }
                let (on_ms, off_ms) = segment_durations(guard.period_ms, guard.duty);
                let segment = if guard.is_on { on_ms } else { off_ms };
                segment.max(1)
            };

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                    let now_on = {
                        let mut guard = shared.lock().unwrap();
                        if !guard.running {
                            break;
                        }
                        guard.is_on = !guard.is_on;
                        guard.is_on
                    };
                    if now_on {
                        sink.on_high();
                    } else {
                        sink.on_low();
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(PwmCommand::Resync) => continue,
                        Some(PwmCommand::Stop) | None => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingSink {
        highs: AtomicU32,
        lows: AtomicU32,
    }

    impl PwmSink for CountingSink {
        fn on_high(&self) {
            self.highs.fetch_add(1, Ordering::SeqCst);
        }
        fn on_low(&self) {
            self.lows.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_segment_durations_round_and_clamp() {
        assert_eq!(segment_durations(1000, 0.5), (500, 500));
        assert_eq!(segment_durations(1000, 0.0), (0, 1000));
        assert_eq!(segment_durations(1000, 1.0), (1000, 0));
        assert_eq!(segment_durations(250, 0.333), (83, 167));
        // Rounding, not truncation.
        assert_eq!(segment_durations(1000, 0.0505), (51, 949));
    }

    #[tokio::test]
    async fn test_edges_alternate_at_half_duty() {
        let sink = Arc::new(CountingSink::default());
        let pwm = SlowPwm::new(40, 0.5, sink.clone());
        pwm.start().unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        pwm.stop().unwrap();

        let highs = sink.highs.load(Ordering::SeqCst);
        let lows = sink.lows.load(Ordering::SeqCst);
        assert!(highs >= 2, "expected >= 2 ON edges, got {}", highs);
        assert!(lows >= 2, "expected >= 2 OFF edges, got {}", lows);
        // Alternating edges can differ by at most one.
        assert!(highs.abs_diff(lows) <= 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_future_edges() {
        let sink = Arc::new(CountingSink::default());
        let pwm = SlowPwm::new(20, 0.5, sink.clone());
        pwm.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pwm.stop().unwrap();
        assert!(!pwm.is_running());

        let highs = sink.highs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.highs.load(Ordering::SeqCst), highs);
    }

    #[tokio::test]
    async fn test_force_on_fires_immediately_when_stopped() {
        let sink = Arc::new(CountingSink::default());
        let pwm = SlowPwm::new(1000, 0.0, sink.clone());

        pwm.force_on();
        assert_eq!(sink.highs.load(Ordering::SeqCst), 1);
        // Already on: no duplicate callback.
        pwm.force_on();
        assert_eq!(sink.highs.load(Ordering::SeqCst), 1);

        pwm.force_off();
        assert_eq!(sink.lows.load(Ordering::SeqCst), 1);
        pwm.force_off();
        assert_eq!(sink.lows.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duty_and_period_setters_clamp() {
        let sink = Arc::new(CountingSink::default());
        let pwm = SlowPwm::new(0, 1.7, sink);
        // Constructor sanitizes.
        assert_eq!(pwm.period_ms(), 1);
        assert_eq!(pwm.duty_cycle(), 1.0);

        pwm.set_duty_cycle(-0.5);
        assert_eq!(pwm.duty_cycle(), 0.0);
        pwm.set_duty_cycle(f64::NAN);
        assert_eq!(pwm.duty_cycle(), 0.0);
        pwm.set_period_ms(0);
        assert_eq!(pwm.period_ms(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let sink = Arc::new(CountingSink::default());
        let pwm = SlowPwm::new(50, 0.5, sink.clone());
        pwm.start().unwrap();
        pwm.start().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        pwm.stop().unwrap();

        // A doubled task would produce roughly twice the edges of one 50 ms
        // half-period schedule; stay well under that.
        let total = sink.highs.load(Ordering::SeqCst) + sink.lows.load(Ordering::SeqCst);
        assert!(total <= 8, "too many edges for a single task: {}", total);
    }
}
