//! Health report shared between the frame loop and observers.
//!
//! The frame loop is the only writer. Readers (HTTP handlers, the CLI) take
//! a cloned [`HealthReport`] under a short read lock and never block frames
//! for longer than the copy.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lumen_core::{EngineState, VisualizationMode};

use crate::daemon::DaemonState;

/// Weight of the newest frame in the reported stage timings.
pub const STAGE_SMOOTHING: f32 = 0.1;

/// Milliseconds spent in each stage of a frame. The health report carries
/// an exponential moving average, not the last frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub snapshot: f32,
    pub extract: f32,
    pub inference: f32,
    pub interpolate: f32,
    pub morph: f32,
    pub encode: f32,
    pub total: f32,
}

impl StageTimings {
    /// Move each stage `weight` of the way towards `sample`.
    pub fn smoothed(self, sample: StageTimings, weight: f32) -> Self {
        let mix = |old: f32, new: f32| old + (new - old) * weight;
        Self {
            snapshot: mix(self.snapshot, sample.snapshot),
            extract: mix(self.extract, sample.extract),
            inference: mix(self.inference, sample.inference),
            interpolate: mix(self.interpolate, sample.interpolate),
            morph: mix(self.morph, sample.morph),
            encode: mix(self.encode, sample.encode),
            total: mix(self.total, sample.total),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Measured frame rate, smoothed.
    pub fps: f32,
    /// Rate the governor is currently aiming for.
    pub target_fps: f32,
    pub frames: u64,
    pub overruns: u64,
    /// Frames the sink refused.
    pub dropped: u64,
    /// Frames skipped because a stage failed or panicked.
    pub errors: u64,
    pub engine_state: EngineState,
    pub mode: VisualizationMode,
    pub blend_progress: f32,
    /// Average stage timings, see [`STAGE_SMOOTHING`].
    pub stage_ms: StageTimings,
    #[serde(skip)]
    timed_frames: u64,
    pub daemon_state: DaemonState,
    pub instance_id: Uuid,
}

impl HealthReport {
    pub fn new(instance_id: Uuid, target_fps: f32) -> Self {
        Self {
            fps: 0.0,
            target_fps,
            frames: 0,
            overruns: 0,
            dropped: 0,
            errors: 0,
            engine_state: EngineState::Uninitialized,
            mode: VisualizationMode::Idle,
            blend_progress: 1.0,
            stage_ms: StageTimings::default(),
            timed_frames: 0,
            daemon_state: DaemonState::Idle,
            instance_id,
        }
    }

    pub fn is_running(&self) -> bool {
        self.daemon_state == DaemonState::Running
    }
}

/// Cheap-to-clone handle on the live report.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<RwLock<HealthReport>>,
}

impl MetricsRegistry {
    pub fn new(instance_id: Uuid, target_fps: f32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthReport::new(instance_id, target_fps))),
        }
    }

    pub fn snapshot(&self) -> HealthReport {
        self.inner.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut HealthReport)) {
        f(&mut self.inner.write());
    }

    pub fn set_daemon_state(&self, state: DaemonState) {
        self.inner.write().daemon_state = state;
    }

    pub fn record_error(&self) {
        self.inner.write().errors += 1;
    }

    pub fn record_dropped(&self) {
        self.inner.write().dropped += 1;
    }

    pub fn record_overrun(&self) {
        self.inner.write().overruns += 1;
    }

    /// Fold one frame's stage timings into the running average.
    pub fn record_timings(&self, sample: StageTimings) {
        let mut report = self.inner.write();
        report.stage_ms = if report.timed_frames == 0 {
            sample
        } else {
            report.stage_ms.smoothed(sample, STAGE_SMOOTHING)
        };
        report.timed_frames += 1;
    }
}
