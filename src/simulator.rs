//! Synthetic telemetry stream.
//!
//! With no vehicle attached the console still needs live-looking data. The
//! simulator appends one sample per tick, each derived from the latest stored
//! sample with small bounded noise:
//! - yaw/pitch/roll drift around the previous attitude
//! - battery voltage only ever drains, floored at [`BATTERY_FLOOR_V`]
//! - current and both temperatures are redrawn every tick
//! - a leak is reported with probability [`LEAK_PROBABILITY`]
//!
//! The task owns its own `Arc<Database>` and runs until its
//! [`SimulatorHandle`] is stopped.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::database::{Database, DatabaseError};
use crate::models::{TelemetryPoint, TelemetrySample};

pub const BATTERY_FLOOR_V: f64 = 14.5;
pub const BATTERY_CURRENT_FLOOR_A: f64 = 0.5;
pub const LEAK_PROBABILITY: f64 = 0.01;

const DEFAULT_BATTERY_V: f64 = 15.8;
const DEFAULT_TURBIDITY: f64 = 0.3;
const MAX_DRAIN_PER_TICK_V: f64 = 0.01;

/// Derive the next sample from the previous one.
///
/// Missing baseline fields fall back to the resting defaults (level attitude,
/// 15.8 V, turbidity 0.3).
pub fn next_sample<R: Rng>(baseline: Option<&TelemetryPoint>, rng: &mut R) -> TelemetryPoint {
    let prev = |field: fn(&TelemetryPoint) -> Option<f64>, default: f64| {
        baseline.and_then(field).unwrap_or(default)
    };

    let yaw = prev(|p| p.yaw, 0.0) + rng.gen_range(-0.4..=0.4);
    let pitch = prev(|p| p.pitch, 0.0) + rng.gen_range(-0.3..=0.3);
    let roll = prev(|p| p.roll, 0.0) + rng.gen_range(-0.3..=0.3);

    let battery_v = (prev(|p| p.battery_v, DEFAULT_BATTERY_V)
        - rng.gen_range(0.0..=MAX_DRAIN_PER_TICK_V))
    .max(BATTERY_FLOOR_V);
    let battery_i = (3.0_f64 + rng.gen_range(-2.0..=3.0)).max(BATTERY_CURRENT_FLOOR_A);
    let turbidity = (prev(|p| p.turbidity, DEFAULT_TURBIDITY) + rng.gen_range(-0.05..=0.08)).max(0.0);

    let water_temp = 21.5 + rng.gen_range(-0.4..=0.4);
    let internal_temp = 32.0 + rng.gen_range(-0.2..=0.4);
    let leak = rng.gen_bool(LEAK_PROBABILITY);

    TelemetryPoint {
        yaw: Some(yaw),
        pitch: Some(pitch),
        roll: Some(roll),
        battery_v: Some(battery_v),
        battery_i: Some(battery_i),
        water_temp: Some(water_temp),
        turbidity: Some(turbidity),
        leak,
        internal_temp: Some(internal_temp),
    }
}

pub struct TelemetrySimulator {
    db: Arc<Database>,
    interval: Duration,
    rng: StdRng,
}

impl TelemetrySimulator {
    pub fn new(db: Arc<Database>, interval: Duration) -> Self {
        Self::with_rng(db, interval, StdRng::from_entropy())
    }

    /// Build a simulator with a caller-supplied RNG (seeded in tests)
    pub fn with_rng(db: Arc<Database>, interval: Duration, rng: StdRng) -> Self {
        Self { db, interval, rng }
    }

    /// Append one derived sample in a single storage transaction.
    pub fn tick(&mut self) -> Result<TelemetrySample, DatabaseError> {
        let rng = &mut self.rng;
        let sample = self
            .db
            .append_derived_sample(|baseline| next_sample(baseline, rng))?;

        if sample.point.leak {
            log::warn!("Simulated leak in sample {}", sample.id);
        }
        log::debug!(
            "Simulated sample {} (battery {:.3} V)",
            sample.id,
            sample.point.battery_v.unwrap_or_default()
        );
        Ok(sample)
    }

    /// Start the background loop: one tick right away, then one per interval.
    pub fn spawn(mut self) -> SimulatorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.interval;

        let task = tokio::spawn(async move {
            log::info!("Telemetry simulator started ({} ms interval)", interval.as_millis());
            loop {
                if let Err(e) = self.tick() {
                    log::error!("Telemetry simulator tick failed: {}", e);
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        // A dropped sender also ends the loop.
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("Telemetry simulator stopped");
        });

        SimulatorHandle { stop_tx, task }
    }
}

/// Handle to a running simulator task
pub struct SimulatorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SimulatorHandle {
    /// Signal the loop to exit at its next await point.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            log::error!("Telemetry simulator task ended abnormally: {}", e);
        }
    }
}
