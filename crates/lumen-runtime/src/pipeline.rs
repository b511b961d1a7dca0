//! One frame, start to finish.
//!
//! [`FramePipeline`] owns every per-frame stage and runs them in a fixed
//! order. Stage state (smoothing history, mode and blend progress, the last
//! emitted set) is only committed once the frame has been encoded, so a frame
//! that fails part way leaves those stages as the previous frame left them.
//! The engine is the exception: an accelerator fault demotes it to the
//! fallback immediately, and that sticks whether or not the frame completes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lumen_core::{
    AbsentHostSampler, EngineState, FeatureExtractor, FrameMeta, HostSampler, InferenceEngine, Interpolator,
    MorphingController, ProcHostSampler, ProtocolEncoder, SharedState, VisualizationMode, animate,
    time::Clock,
};

use crate::config::LumenConfig;
use crate::error::Result;
use crate::metrics::StageTimings;
use crate::sink::FrameBytes;

/// Everything the daemon needs to know about a finished frame.
#[derive(Clone, Debug)]
pub struct FrameOutput {
    pub bytes: FrameBytes,
    pub frame_id: u32,
    pub mode: VisualizationMode,
    pub particle_count: usize,
    pub accelerated: bool,
    pub blending: bool,
    pub blend_progress: f32,
    pub engine_state: EngineState,
    pub timings: StageTimings,
}

/// Anything the daemon can drive once per tick.
pub trait FrameProducer: Send {
    /// Produce the next frame. `frame_dt` is the wall time since the last
    /// tick in seconds, `fps` the measured rate stamped into the header.
    fn run_frame(&mut self, frame_dt: f32, fps: f32) -> Result<FrameOutput>;

    /// Release resources. Called once from the frame thread on stop.
    fn shutdown(&mut self) {}
}

pub struct FramePipeline {
    state: SharedState,
    clock: Arc<dyn Clock>,
    origin_ms: u64,
    extractor: FeatureExtractor,
    engine: InferenceEngine,
    interpolator: Interpolator,
    morph: MorphingController,
    encoder: ProtocolEncoder,
    next_frame_id: u32,
}

fn ms(d: Duration) -> f32 {
    d.as_secs_f32() * 1000.0
}

impl FramePipeline {
    pub fn new(
        state: SharedState,
        extractor: FeatureExtractor,
        engine: InferenceEngine,
        interpolator: Interpolator,
        morph: MorphingController,
        encoder: ProtocolEncoder,
    ) -> Self {
        let clock = state.clock();
        let origin_ms = clock.now_millis();
        Self {
            state,
            clock,
            origin_ms,
            extractor,
            engine,
            interpolator,
            morph,
            encoder,
            next_frame_id: 1,
        }
    }

    /// Build every stage from configuration. Fails only on configuration
    /// errors; a missing or broken accelerator just means fallback.
    pub fn from_config(config: &LumenConfig, state: SharedState) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(config.catalog());
        let sampler: Box<dyn HostSampler> = if config.features.host_sampling {
            Box::new(ProcHostSampler)
        } else {
            Box::new(AbsentHostSampler)
        };
        let extractor =
            FeatureExtractor::with_sampler(sampler, Duration::from_millis(config.features.host_cache_ms));
        let engine = InferenceEngine::new(catalog.clone(), config.backend_factory()?, config.engine_config());
        let morph = MorphingController::new(catalog, config.transition());
        tracing::info!(
            "pipeline ready: backend={}, {} attributes/particle, transition {:.2}s",
            config.engine.backend,
            config.pipeline.attributes.k(),
            config.morph.transition_secs
        );
        Ok(Self::new(
            state,
            extractor,
            engine,
            Interpolator::new(config.pipeline.alpha),
            morph,
            ProtocolEncoder::new(config.pipeline.attributes),
        ))
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn current_mode(&self) -> VisualizationMode {
        self.morph.current_mode()
    }

    /// Bring the engine out of `Uninitialized` ahead of the first frame.
    pub fn warm_up(&mut self) -> EngineState {
        self.engine.initialize()
    }

    pub fn shutdown(&mut self) {
        self.engine.shutdown();
    }

    pub fn run_frame(&mut self, frame_dt: f32, fps: f32) -> Result<FrameOutput> {
        // Ids are consumed even by frames that fail, so a gap marks a skip.
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1).max(1);

        let start = Instant::now();
        let snapshot = self.state.snapshot();
        let t_snapshot = start.elapsed();

        let features = self.extractor.extract(&snapshot);
        let t_extract = start.elapsed();

        let target = self.morph.select_mode(&snapshot);
        let step = self.morph.plan(target, frame_dt);
        let mode = step.mode();
        let mut raw = self.engine.predict(&features, mode, self.morph.count(mode));
        let accelerated = self.engine.is_accelerated();
        let t_inference = start.elapsed();

        animate(mode, &mut raw, step.elapsed());
        let smoothed = self.interpolator.preview(&raw);
        let t_interpolate = start.elapsed();

        let particles = self.morph.compose(&step, &smoothed, &features);
        let t_morph = start.elapsed();

        let meta = FrameMeta {
            frame_id,
            timestamp_ms: self.clock.now_millis().saturating_sub(self.origin_ms),
            mode,
            accelerated,
            blending: step.is_blending(),
            fps,
            inference_ms: ms(t_inference - t_extract),
            total_ms: ms(t_morph),
        };
        let bytes = self.encoder.encode(&particles, &meta)?;
        let t_encode = start.elapsed();

        self.interpolator.commit(&smoothed);
        let particle_count = particles.len();
        self.morph.commit(step, particles);

        Ok(FrameOutput {
            bytes: Arc::from(bytes),
            frame_id,
            mode,
            particle_count,
            accelerated,
            blending: meta.blending,
            blend_progress: step.blend_progress(),
            engine_state: self.engine.state(),
            timings: StageTimings {
                snapshot: ms(t_snapshot),
                extract: ms(t_extract - t_snapshot),
                inference: ms(t_inference - t_extract),
                interpolate: ms(t_interpolate - t_inference),
                morph: ms(t_morph - t_interpolate),
                encode: ms(t_encode - t_morph),
                total: ms(t_encode),
            },
        })
    }
}

impl FrameProducer for FramePipeline {
    fn run_frame(&mut self, frame_dt: f32, fps: f32) -> Result<FrameOutput> {
        FramePipeline::run_frame(self, frame_dt, fps)
    }

    fn shutdown(&mut self) {
        FramePipeline::shutdown(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::{ManualClock, decode};

    fn small_config() -> LumenConfig {
        let mut config = LumenConfig::default();
        config.features.host_sampling = false;
        for mode in VisualizationMode::ALL {
            config.morph.counts.insert(mode.name().to_string(), 64);
        }
        config
    }

    #[test]
    fn test_frames_decode_and_count() {
        let clock = ManualClock::new();
        let state = SharedState::with_clock(Arc::new(clock.clone()));
        let mut pipeline = FramePipeline::from_config(&small_config(), state).unwrap();

        clock.advance(Duration::from_millis(40));
        let out = pipeline.run_frame(1.0 / 30.0, 30.0).unwrap();
        assert_eq!(out.frame_id, 1);
        assert_eq!(out.mode, VisualizationMode::Idle);
        assert_eq!(out.particle_count, 64);
        assert_eq!(out.engine_state, EngineState::Fallback);

        let frame = decode(&out.bytes).unwrap();
        assert_eq!(frame.header.frame_id, 1);
        assert_eq!(frame.header.timestamp_ms, 40);
        assert_eq!(frame.particle_count(), 64);
        assert!(out.timings.total >= out.timings.inference);

        let next = pipeline.run_frame(1.0 / 30.0, 30.0).unwrap();
        assert_eq!(next.frame_id, 2);
    }

    #[test]
    fn test_state_change_selects_mode() {
        let state = SharedState::new();
        let mut pipeline = FramePipeline::from_config(&small_config(), state.clone()).unwrap();
        pipeline.run_frame(1.0 / 30.0, 30.0).unwrap();
        state.set("threat.level", 0.9);
        let out = pipeline.run_frame(1.0 / 30.0, 30.0).unwrap();
        assert_eq!(out.mode, VisualizationMode::Alert);
        assert!(out.blending);
        assert_eq!(pipeline.current_mode(), VisualizationMode::Alert);
    }

    #[test]
    fn test_reference_backend_from_config() {
        let mut config = small_config();
        config.engine.backend = "reference".to_string();
        config.engine.warmup_runs = 1;
        config.engine.inference_timeout_ms = 1000;
        let mut pipeline = FramePipeline::from_config(&config, SharedState::new()).unwrap();
        assert_eq!(pipeline.warm_up(), EngineState::Accelerated);
        let out = pipeline.run_frame(1.0 / 30.0, 30.0).unwrap();
        assert!(out.accelerated);
        assert!(decode(&out.bytes).unwrap().header.is_accelerated());
        pipeline.shutdown();
    }
}
