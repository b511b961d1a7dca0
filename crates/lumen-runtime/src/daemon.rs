//! The frame loop.
//!
//! [`PipelineDaemon`] moves a [`FrameProducer`] and a [`FrameSink`] onto a
//! dedicated `lumen-frame-loop` thread and ticks at the governor's current
//! rate until asked to stop. Everything observable from outside goes through
//! the cloneable [`DaemonHandle`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{Result, RuntimeError};
use crate::governor::{FrameGovernor, LogThrottle};
use crate::metrics::{HealthReport, MetricsRegistry};
use crate::pipeline::FrameProducer;
use crate::sink::{FrameSink, Offer};

/// Longest wait between stop-flag checks while sleeping off the budget.
pub const SLEEP_CHUNK: Duration = Duration::from_millis(50);

/// Upper bound on the animation step fed to a frame after a stall.
pub const MAX_FRAME_DT: f32 = 0.25;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DaemonState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl DaemonState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DaemonState::Idle,
            1 => DaemonState::Running,
            2 => DaemonState::Stopping,
            _ => DaemonState::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DaemonState::Idle => "idle",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
            DaemonState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct DaemonSettings {
    pub target_fps: f32,
    pub min_fps: f32,
    pub overrun_window: usize,
    pub overrun_ratio: f32,
    pub instance_id: Uuid,
}

impl DaemonSettings {
    pub fn from_config(pipeline: &PipelineConfig) -> Self {
        Self {
            target_fps: pipeline.target_fps,
            min_fps: pipeline.min_fps,
            overrun_window: pipeline.overrun_window,
            overrun_ratio: pipeline.overrun_ratio,
            instance_id: Uuid::new_v4(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

struct Lifecycle {
    state: AtomicU8,
    stop: AtomicBool,
}

impl Lifecycle {
    fn state(&self) -> DaemonState {
        DaemonState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: DaemonState, metrics: &MetricsRegistry) {
        self.state.store(state as u8, Ordering::Release);
        metrics.set_daemon_state(state);
    }
}

/// Read-only view on a daemon plus the ability to ask it to stop.
#[derive(Clone)]
pub struct DaemonHandle {
    lifecycle: Arc<Lifecycle>,
    metrics: MetricsRegistry,
}

impl DaemonHandle {
    pub fn state(&self) -> DaemonState {
        self.lifecycle.state()
    }

    pub fn health(&self) -> HealthReport {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Ask the loop to stop. Returns immediately; the loop notices within
    /// one frame or one sleep chunk.
    pub fn request_stop(&self) {
        self.lifecycle.stop.store(true, Ordering::Release);
        if self.lifecycle.state() == DaemonState::Running {
            self.lifecycle.set(DaemonState::Stopping, &self.metrics);
        }
    }
}

pub struct PipelineDaemon {
    handle: DaemonHandle,
    settings: DaemonSettings,
    parts: Option<(Box<dyn FrameProducer>, Box<dyn FrameSink>)>,
    thread: Option<JoinHandle<()>>,
}

impl PipelineDaemon {
    pub fn new(producer: impl FrameProducer + 'static, sink: Box<dyn FrameSink>, settings: DaemonSettings) -> Self {
        let metrics = MetricsRegistry::new(settings.instance_id, settings.target_fps);
        Self {
            handle: DaemonHandle {
                lifecycle: Arc::new(Lifecycle {
                    state: AtomicU8::new(DaemonState::Idle as u8),
                    stop: AtomicBool::new(false),
                }),
                metrics,
            },
            settings,
            parts: Some((Box::new(producer), sink)),
            thread: None,
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> DaemonState {
        self.handle.state()
    }

    pub fn metrics(&self) -> HealthReport {
        self.handle.health()
    }

    /// Spawn the frame loop. A daemon runs at most once.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != DaemonState::Idle {
            return Err(RuntimeError::InvalidState(format!("cannot start a daemon that is {state}")));
        }
        let Some((producer, sink)) = self.parts.take() else {
            return Err(RuntimeError::InvalidState("daemon has no pipeline".to_string()));
        };

        tracing::info!(
            "starting frame loop at {:.1} fps (sink: {}, instance {})",
            self.settings.target_fps,
            sink.name(),
            self.settings.instance_id
        );
        let lifecycle = self.handle.lifecycle.clone();
        let metrics = self.handle.metrics.clone();
        let settings = self.settings.clone();
        lifecycle.set(DaemonState::Running, &metrics);
        let thread = thread::Builder::new()
            .name("lumen-frame-loop".to_string())
            .spawn(move || frame_loop(producer, sink, lifecycle, metrics, settings));
        match thread {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.handle.lifecycle.set(DaemonState::Stopped, &self.handle.metrics);
                Err(RuntimeError::Io(e))
            }
        }
    }

    /// Stop the loop and wait for it to release the engine.
    pub fn stop(&mut self) {
        self.handle.request_stop();

        if let Some((mut producer, _)) = self.parts.take() {
            producer.shutdown();
            self.handle.lifecycle.set(DaemonState::Stopped, &self.handle.metrics);
            return;
        }
        let Some(thread) = self.thread.take() else {
            return;
        };

        let (tx, rx) = mpsc::channel();
        let joiner = thread::spawn(move || {
            let _ = tx.send(thread.join());
        });
        match rx.recv_timeout(STOP_TIMEOUT) {
            Ok(Ok(())) => {
                let _ = joiner.join();
                tracing::info!("frame loop stopped");
            }
            Ok(Err(_)) => {
                tracing::error!("frame loop thread panicked");
                self.handle.lifecycle.set(DaemonState::Stopped, &self.handle.metrics);
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("frame loop did not stop within {STOP_TIMEOUT:?}, detaching");
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("frame loop join thread disconnected");
            }
        }
    }
}

impl Drop for PipelineDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Sleep until `deadline` in chunks, returning early when stop is requested.
fn sleep_until(deadline: Instant, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_CHUNK));
    }
}

fn frame_loop(
    mut producer: Box<dyn FrameProducer>,
    mut sink: Box<dyn FrameSink>,
    lifecycle: Arc<Lifecycle>,
    metrics: MetricsRegistry,
    settings: DaemonSettings,
) {
    let mut governor = FrameGovernor::new(
        settings.target_fps,
        settings.min_fps,
        settings.overrun_window,
        settings.overrun_ratio,
    );
    let mut error_log = LogThrottle::new(Duration::from_secs(5));
    let mut drop_log = LogThrottle::new(Duration::from_secs(10));
    let mut fps = 0.0f32;
    let mut last_tick = Instant::now()
        .checked_sub(governor.frame_budget())
        .unwrap_or_else(Instant::now);
    let mut tick_no: u64 = 0;

    while !lifecycle.stop.load(Ordering::Acquire) {
        let tick = Instant::now();
        let frame_dt = tick.duration_since(last_tick).as_secs_f32().clamp(0.0, MAX_FRAME_DT);
        last_tick = tick;
        tick_no += 1;
        if frame_dt > 0.0 {
            let instant_fps = 1.0 / frame_dt;
            fps = if fps == 0.0 { instant_fps } else { fps * 0.9 + instant_fps * 0.1 };
        }

        match panic::catch_unwind(AssertUnwindSafe(|| producer.run_frame(frame_dt, fps))) {
            Ok(Ok(out)) => {
                let offer = sink.offer(out.bytes);
                metrics.update(|r| {
                    r.frames += 1;
                    r.fps = fps;
                    r.engine_state = out.engine_state;
                    r.mode = out.mode;
                    r.blend_progress = out.blend_progress;
                });
                metrics.record_timings(out.timings);
                if offer == Offer::Dropped {
                    metrics.record_dropped();
                    if drop_log.allow() {
                        tracing::warn!(
                            "sink '{}' refused frame {} ({} more dropped since last report)",
                            sink.name(),
                            out.frame_id,
                            drop_log.take_suppressed()
                        );
                    }
                }
            }
            Ok(Err(e)) => {
                metrics.record_error();
                if error_log.allow() {
                    tracing::error!("frame {tick_no} skipped: {e}");
                } else {
                    tracing::debug!("frame {tick_no} skipped: {e}");
                }
            }
            Err(payload) => {
                metrics.record_error();
                if error_log.allow() {
                    tracing::error!("frame {tick_no} panicked: {}", panic_message(payload.as_ref()));
                }
            }
        }

        let budget = governor.frame_budget();
        let overran = tick.elapsed() > budget;
        if overran {
            metrics.record_overrun();
        }
        if let Some(target) = governor.record(overran) {
            metrics.update(|r| r.target_fps = target);
        }
        if !overran {
            sleep_until(tick + budget, &lifecycle.stop);
        }
    }

    lifecycle.set(DaemonState::Stopping, &metrics);
    producer.shutdown();
    lifecycle.set(DaemonState::Stopped, &metrics);
    tracing::debug!("frame loop exited after {tick_no} ticks");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            DaemonState::Idle,
            DaemonState::Running,
            DaemonState::Stopping,
            DaemonState::Stopped,
        ] {
            assert_eq!(DaemonState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_sleep_until_returns_on_stop() {
        let stop = AtomicBool::new(true);
        let start = Instant::now();
        sleep_until(start + Duration::from_secs(10), &stop);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
