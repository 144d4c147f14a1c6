//! Simulated tracing backend.
//!
//! Synthesizes a plausible present stream per watched pid: QPC
//! timestamps advance by a frame interval with small random jitter,
//! frames are displayed one subframe each, and an occasional frame is
//! discarded so the dropped paths stay exercised. Telemetry scalars
//! wander around fixed baselines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frameline_core::frame::{FrameData, FrameType, PresentResult};
use frameline_core::ServiceError;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{FrameFeed, SourceAnchor, TraceSource};

/// Counter frequency of the simulated clock, ticks per second.
const COUNTER_FREQUENCY_HZ: u64 = 10_000_000;

/// Every Nth simulated frame is discarded before display.
const DROP_CADENCE: u64 = 16;

/// Buffered frames per feed before backpressure.
const FEED_DEPTH: usize = 256;

/// Configuration of a [`SimulatedSource`].
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Interval between synthesized presents.
    pub frame_interval: Duration,
    /// Simulated target lifetime; the feed closes after this elapses,
    /// as if the process exited. `None` runs until unwatched.
    pub process_lifetime: Option<Duration>,
    /// Application name stamped into each frame.
    pub app_name: String,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(4),
            process_lifetime: None,
            app_name: "presenter.exe".to_owned(),
        }
    }
}

/// Simulated tracing backend.
#[derive(Debug)]
pub struct SimulatedSource {
    config: SimulatedConfig,
    anchor: SourceAnchor,
    telemetry_period_ms: Arc<AtomicU32>,
    flush_period_ms: Arc<AtomicU32>,
    watchers: HashMap<u32, JoinHandle<()>>,
}

impl SimulatedSource {
    /// Opens the simulated backend.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::SourceInit`] when the configuration is
    /// unusable (a zero frame interval cannot drive the clock).
    pub fn open(config: SimulatedConfig) -> Result<Self, ServiceError> {
        if config.frame_interval.is_zero() {
            return Err(ServiceError::SourceInit {
                reason: "frame interval must be non-zero".to_owned(),
            });
        }
        let anchor = SourceAnchor {
            qpc_start: 1_000_000,
            #[allow(clippy::cast_precision_loss)]
            counter_period_ms: 1_000.0 / COUNTER_FREQUENCY_HZ as f64,
        };
        info!(
            frame_interval_us = config.frame_interval.as_micros() as u64,
            "simulated tracing source opened"
        );
        Ok(Self {
            config,
            anchor,
            telemetry_period_ms: Arc::new(AtomicU32::new(0)),
            flush_period_ms: Arc::new(AtomicU32::new(0)),
            watchers: HashMap::new(),
        })
    }

    /// Last telemetry period applied to the backend, for tests.
    #[must_use]
    pub fn applied_telemetry_period(&self) -> u32 {
        self.telemetry_period_ms.load(Ordering::Relaxed)
    }

    /// Last flush period applied to the backend, for tests.
    #[must_use]
    pub fn applied_flush_period(&self) -> u32 {
        self.flush_period_ms.load(Ordering::Relaxed)
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        for (_, task) in self.watchers.drain() {
            task.abort();
        }
    }
}

impl TraceSource for SimulatedSource {
    fn anchor(&self) -> SourceAnchor {
        self.anchor
    }

    fn set_telemetry_period(&mut self, ms: u32) {
        self.telemetry_period_ms.store(ms, Ordering::Relaxed);
        debug!(ms, "telemetry period applied to source");
    }

    fn set_flush_period(&mut self, ms: u32) {
        self.flush_period_ms.store(ms, Ordering::Relaxed);
        debug!(ms, "flush period applied to source");
    }

    fn watch_process(&mut self, pid: u32) -> Result<FrameFeed, ServiceError> {
        let (tx, rx) = mpsc::channel(FEED_DEPTH);
        let generator = FrameGenerator::new(pid, &self.config, self.anchor);
        let lifetime = self.config.process_lifetime;
        let interval = self.config.frame_interval;
        let task = tokio::spawn(generate_frames(tx, generator, interval, lifetime));
        if let Some(previous) = self.watchers.insert(pid, task) {
            previous.abort();
        }
        Ok(rx)
    }

    fn unwatch_process(&mut self, pid: u32) {
        if let Some(task) = self.watchers.remove(&pid) {
            task.abort();
            debug!(pid, "stopped simulated frame generation");
        }
    }
}

async fn generate_frames(
    tx: mpsc::Sender<FrameData>,
    mut generator: FrameGenerator,
    interval: Duration,
    lifetime: Option<Duration>,
) {
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if let Some(lifetime) = lifetime {
            if started.elapsed() >= lifetime {
                debug!(pid = generator.pid, "simulated target lifetime elapsed");
                return; // dropping tx ends the feed
            }
        }
        if tx.send(generator.next_frame()).await.is_err() {
            return; // feed consumer went away
        }
    }
}

/// Per-pid synthesis state.
struct FrameGenerator {
    pid: u32,
    qpc: u64,
    frame_ticks: u64,
    counter: u64,
    app_name: String,
    rng: SmallRng,
}

impl FrameGenerator {
    fn new(pid: u32, config: &SimulatedConfig, anchor: SourceAnchor) -> Self {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let frame_ticks =
            (config.frame_interval.as_secs_f64() * COUNTER_FREQUENCY_HZ as f64) as u64;
        Self {
            pid,
            qpc: anchor.qpc_start,
            frame_ticks,
            counter: 0,
            app_name: config.app_name.clone(),
            rng: SmallRng::seed_from_u64(u64::from(pid)),
        }
    }

    fn next_frame(&mut self) -> FrameData {
        self.counter += 1;
        let jitter = self.rng.gen_range(0..self.frame_ticks / 8 + 1);
        self.qpc += self.frame_ticks + jitter;

        let start = self.qpc;
        let in_present = self.frame_ticks / 10;
        let gpu_start = start + in_present;
        let gpu_duration = self.frame_ticks / 2;
        let ready = gpu_start + gpu_duration + self.frame_ticks / 10;
        let dropped = self.counter % DROP_CADENCE == 0;

        let mut frame = FrameData::default();
        let present = &mut frame.present;
        present.set_application(&self.app_name);
        present.swap_chain_address = 0x7f00_0000_0000 + u64::from(self.pid);
        present.present_mode = 1;
        present.runtime = 1;
        present.sync_interval = 1;
        present.supports_tearing = true;
        present.present_start_time = start;
        present.time_in_present = in_present;
        present.gpu_start_time = gpu_start;
        present.ready_time = ready;
        present.gpu_duration = gpu_duration;
        // Every other frame is rendered from an input event.
        if self.counter % 2 == 0 {
            present.input_time = start.saturating_sub(self.frame_ticks / 2);
        }
        if dropped {
            present.final_state = PresentResult::Discarded;
        } else {
            present.final_state = PresentResult::Presented;
            present.displayed_count = 1;
            present.displayed_screen_time[0] = ready + self.frame_ticks / 4;
            present.displayed_frame_type[0] = FrameType::Application;
        }

        frame.gpu.gpu_power_w = 120.0 + self.rng.gen_range(-10.0..10.0);
        frame.gpu.gpu_frequency_mhz = 1_800.0 + self.rng.gen_range(-50.0..50.0);
        frame.gpu.gpu_temperature_c = 70.0 + self.rng.gen_range(-2.0..2.0);
        frame.gpu.gpu_utilization = self.rng.gen_range(60.0..99.0);
        frame.gpu.gpu_mem_total_size_b = 8 << 30;
        frame.gpu.gpu_mem_used_b = 3 << 30;
        frame.cpu.cpu_utilization = self.rng.gen_range(20.0..60.0);
        frame.cpu.cpu_power_w = 45.0 + self.rng.gen_range(-5.0..5.0);
        frame.cpu.cpu_temperature = 60.0 + self.rng.gen_range(-3.0..3.0);
        frame.cpu.cpu_frequency = 4.0 + self.rng.gen_range(-0.5..0.5);
        frame
    }
}
