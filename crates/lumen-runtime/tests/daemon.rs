//! Frame loop lifecycle, sink handoff, fault isolation and rate adaptation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lumen_core::{Clock, EngineState, SharedState, VisualizationMode, decode};
use lumen_runtime::{
    ChannelSink, DaemonHandle, DaemonSettings, DaemonState, FrameOutput, FramePipeline, FrameProducer,
    HealthReport, LumenConfig, NullSink, PipelineDaemon, RecorderSink, RecordingReader, RuntimeError,
    StageTimings,
};

fn small_config() -> LumenConfig {
    let mut config = LumenConfig::default();
    config.features.host_sampling = false;
    for mode in VisualizationMode::ALL {
        config.morph.counts.insert(mode.name().to_string(), 128);
    }
    config
}

fn pipeline() -> FramePipeline {
    FramePipeline::from_config(&small_config(), lumen_core::SharedState::new()).unwrap()
}

fn wait_for(handle: &DaemonHandle, what: impl Fn(&HealthReport) -> bool) -> HealthReport {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let report = handle.health();
        if what(&report) {
            return report;
        }
        assert!(Instant::now() < deadline, "timed out, last report: {report:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn start_and_stop_within_a_frame() {
    let mut daemon = PipelineDaemon::new(pipeline(), Box::new(NullSink), DaemonSettings::default());
    let handle = daemon.handle();
    assert_eq!(daemon.state(), DaemonState::Idle);

    daemon.start().unwrap();
    assert_eq!(daemon.state(), DaemonState::Running);
    let report = wait_for(&handle, |r| r.frames >= 3);
    assert!(report.is_running());
    assert_eq!(report.engine_state, EngineState::Fallback);
    assert_eq!(report.mode, VisualizationMode::Idle);

    let t0 = Instant::now();
    daemon.stop();
    assert!(t0.elapsed() < Duration::from_millis(500), "stop took {:?}", t0.elapsed());
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert_eq!(handle.health().daemon_state, DaemonState::Stopped);

    let err = daemon.start().unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidState(_)));
}

#[test]
fn stop_before_start() {
    let mut daemon = PipelineDaemon::new(pipeline(), Box::new(NullSink), DaemonSettings::default());
    daemon.stop();
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert!(daemon.start().is_err());
}

#[test]
fn frame_ids_strictly_increase() {
    let (sink, rx) = ChannelSink::new(64);
    let mut daemon = PipelineDaemon::new(pipeline(), Box::new(sink), DaemonSettings::default());
    daemon.start().unwrap();

    let mut last = 0u32;
    for _ in 0..10 {
        let bytes = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let frame = decode(&bytes).unwrap();
        assert!(frame.header.frame_id > last);
        assert_eq!(frame.particle_count(), 128);
        last = frame.header.frame_id;
    }
    daemon.stop();
}

#[test]
fn undrained_sink_counts_drops() {
    let (sink, _rx) = ChannelSink::new(1);
    let mut daemon = PipelineDaemon::new(pipeline(), Box::new(sink), DaemonSettings::default());
    let handle = daemon.handle();
    daemon.start().unwrap();
    let report = wait_for(&handle, |r| r.dropped >= 2);
    assert!(report.frames >= 3);
    assert_eq!(report.errors, 0);
    daemon.stop();
}

/// Fails every other frame and panics once; the loop must keep going.
struct Flaky {
    inner: FramePipeline,
    calls: u32,
}

impl FrameProducer for Flaky {
    fn run_frame(&mut self, frame_dt: f32, fps: f32) -> lumen_runtime::Result<FrameOutput> {
        self.calls += 1;
        if self.calls == 3 {
            panic!("injected panic");
        }
        if self.calls % 2 == 0 {
            return Err(RuntimeError::InvalidState("injected failure".to_string()));
        }
        self.inner.run_frame(frame_dt, fps)
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}

#[test]
fn failing_frames_are_skipped() {
    let (sink, rx) = ChannelSink::new(64);
    let flaky = Flaky {
        inner: pipeline(),
        calls: 0,
    };
    let mut daemon = PipelineDaemon::new(flaky, Box::new(sink), DaemonSettings::default());
    let handle = daemon.handle();
    daemon.start().unwrap();

    let report = wait_for(&handle, |r| r.frames >= 4);
    assert!(report.errors >= 3);
    assert_eq!(handle.state(), DaemonState::Running);
    daemon.stop();

    let frames: Vec<_> = rx.try_iter().map(|b| decode(&b).unwrap()).collect();
    assert!(frames.len() >= 4);
    assert!(frames.windows(2).all(|w| w[0].header.frame_id < w[1].header.frame_id));
}

/// Takes longer than any budget at 50 fps.
struct Slow;

impl FrameProducer for Slow {
    fn run_frame(&mut self, _frame_dt: f32, _fps: f32) -> lumen_runtime::Result<FrameOutput> {
        thread::sleep(Duration::from_millis(30));
        Ok(FrameOutput {
            bytes: Arc::from(Vec::new()),
            frame_id: 0,
            mode: VisualizationMode::Idle,
            particle_count: 0,
            accelerated: false,
            blending: false,
            blend_progress: 1.0,
            engine_state: EngineState::Fallback,
            timings: StageTimings::default(),
        })
    }
}

#[test]
fn overruns_lower_the_target_rate() {
    let settings = DaemonSettings {
        target_fps: 50.0,
        min_fps: 20.0,
        overrun_window: 4,
        overrun_ratio: 0.5,
        ..DaemonSettings::default()
    };
    let mut daemon = PipelineDaemon::new(Slow, Box::new(NullSink), settings);
    let handle = daemon.handle();
    daemon.start().unwrap();
    let report = wait_for(&handle, |r| r.target_fps < 50.0);
    assert!(report.overruns >= 4);
    assert!(report.target_fps <= 37.5 + 1e-3);
    assert!(report.target_fps >= 20.0);
    daemon.stop();
}

#[test]
fn recording_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.lumen");
    {
        let sink = RecorderSink::create(&path).unwrap();
        let mut daemon = PipelineDaemon::new(pipeline(), Box::new(sink), DaemonSettings::default());
        let handle = daemon.handle();
        daemon.start().unwrap();
        wait_for(&handle, |r| r.frames >= 5);
        daemon.stop();
    }

    let frames: Vec<_> = RecordingReader::open(&path)
        .unwrap()
        .map(|bytes| decode(&bytes.unwrap()).unwrap())
        .collect();
    assert!(frames.len() >= 5);
    assert_eq!(frames[0].header.frame_id, 1);
    assert!(frames.windows(2).all(|w| w[1].header.frame_id == w[0].header.frame_id + 1));
}

/// Alternates 10 ms and 20 ms stage timings without sleeping.
#[derive(Default)]
struct Alternating {
    calls: u32,
}

impl FrameProducer for Alternating {
    fn run_frame(&mut self, _frame_dt: f32, _fps: f32) -> lumen_runtime::Result<FrameOutput> {
        self.calls += 1;
        let ms = if self.calls % 2 == 0 { 20.0 } else { 10.0 };
        Ok(FrameOutput {
            bytes: Arc::from(Vec::new()),
            frame_id: self.calls,
            mode: VisualizationMode::Idle,
            particle_count: 0,
            accelerated: false,
            blending: false,
            blend_progress: 1.0,
            engine_state: EngineState::Fallback,
            timings: StageTimings {
                inference: ms,
                total: ms,
                ..StageTimings::default()
            },
        })
    }
}

#[test]
fn stage_timings_are_averaged_across_frames() {
    let settings = DaemonSettings {
        target_fps: 240.0,
        ..DaemonSettings::default()
    };
    let mut daemon = PipelineDaemon::new(Alternating::default(), Box::new(NullSink), settings);
    let handle = daemon.handle();
    daemon.start().unwrap();
    let report = wait_for(&handle, |r| r.frames >= 60);
    daemon.stop();
    // The last frame alone would read 10 or 20.
    assert!((13.0..17.0).contains(&report.stage_ms.total), "{:?}", report.stage_ms);
    assert!((13.0..17.0).contains(&report.stage_ms.inference), "{:?}", report.stage_ms);
}

/// Clock that panics once its allowance of calls runs out.
struct TrippingClock {
    allowance: AtomicI64,
    now: AtomicU64,
}

impl TrippingClock {
    fn new() -> Self {
        Self {
            allowance: AtomicI64::new(i64::MAX),
            now: AtomicU64::new(1_000),
        }
    }

    fn trip_after(&self, calls: i64) {
        self.allowance.store(calls, Ordering::SeqCst);
    }
}

impl Clock for TrippingClock {
    fn now_millis(&self) -> u64 {
        if self.allowance.fetch_sub(1, Ordering::SeqCst) == 0 {
            panic!("clock tripped");
        }
        self.now.fetch_add(33, Ordering::SeqCst)
    }
}

#[test]
fn mode_change_waits_for_a_completed_frame() {
    let clock = Arc::new(TrippingClock::new());
    let state = SharedState::with_clock(clock.clone());
    let mut pipeline = FramePipeline::from_config(&small_config(), state.clone()).unwrap();
    for _ in 0..3 {
        pipeline.run_frame(1.0 / 30.0, 30.0).unwrap();
    }
    assert_eq!(pipeline.current_mode(), VisualizationMode::Idle);

    state.set("interaction.user_present", true);
    // The snapshot read succeeds, the frame timestamp read panics.
    clock.trip_after(1);
    let failed = panic::catch_unwind(AssertUnwindSafe(|| pipeline.run_frame(1.0 / 30.0, 30.0)));
    assert!(failed.is_err());
    assert_eq!(pipeline.current_mode(), VisualizationMode::Idle);

    let out = pipeline.run_frame(1.0 / 30.0, 30.0).unwrap();
    assert_eq!(out.mode, VisualizationMode::Presence);
    assert!(out.blending);
    assert_eq!(out.blend_progress, 0.0);
    assert_eq!(pipeline.current_mode(), VisualizationMode::Presence);
}
