//! Real-time state-to-particle pipeline.
//!
//! Turns a live, loosely-typed view of the world (sensor readings, cognitive
//! state, interaction flags) into a stream of particle frames: a snapshot of
//! [`SharedState`] is reduced to a fixed [`FeatureVector`], mapped to raw
//! positions by the [`InferenceEngine`], smoothed by the [`Interpolator`],
//! shaped and blended by the [`MorphingController`] and serialized by the
//! [`ProtocolEncoder`].
//!
//! No threads of its own apart from the accelerator worker, no sockets, no
//! files. Scheduling and transport live in `lumen-runtime`.

pub mod accelerator;
pub mod animate;
pub mod constants;
pub mod engine;
pub mod fallback;
pub mod features;
pub mod geometry;
pub mod host;
pub mod interpolate;
pub mod modes;
pub mod morph;
pub mod particle;
pub mod protocol;
pub mod quantize;
pub mod reference;
pub mod seed;
pub mod state;
pub mod time;
pub mod value;

pub use accelerator::{AcceleratorBackend, AcceleratorWorker, BackendFactory, QuantizedPredictor};
pub use animate::animate;
pub use constants::{
    DEFAULT_ALPHA, DEFAULT_TARGET_FPS, DEFAULT_TRANSITION_SECS, FEATURE_COUNT, FEATURE_LAYOUT_VERSION,
    HEADER_SIZE, PROTOCOL_VERSION, WORKING_RADIUS,
};
pub use engine::{BackendError, EngineConfig, EngineState, InferenceEngine, ParticlePredictor};
pub use fallback::FallbackPredictor;
pub use features::{FeatureExtractor, FeatureLayout, FeatureVector};
pub use geometry::{Quaternion, Vec3};
pub use host::{AbsentHostSampler, HostSample, HostSampler, ProcHostSampler};
pub use interpolate::Interpolator;
pub use modes::{ModeCatalog, ModeParams, VisualizationMode};
pub use morph::{MorphState, MorphStep, MorphingController};
pub use particle::{ParticleSet, ParticleTarget, RawParticleArray};
pub use protocol::{
    AttributeLayout, DecodedFrame, FrameHeader, FrameMeta, ProtocolEncoder, ProtocolError, decode,
};
pub use reference::ReferenceAccelerator;
pub use seed::{seed_from_json, seed_from_str};
pub use state::{SharedState, StateSnapshot};
pub use time::{Clock, ManualClock, SystemClock};
pub use value::Value;
