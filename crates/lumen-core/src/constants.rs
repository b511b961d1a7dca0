/// Golden angle in radians: 2π / φ², with φ the golden ratio
pub const GOLDEN_ANGLE: f64 = 2.399_963_229_728_653_3;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f32 = 1e-6;

/// Half-extent of the working volume. Engine output is clamped to ±this on every axis.
pub const WORKING_RADIUS: f32 = 6.0;

/// Number of slots in a feature vector.
pub const FEATURE_COUNT: usize = 120;

/// Bumped whenever a slot moves or changes meaning.
pub const FEATURE_LAYOUT_VERSION: u32 = 1;

/// Wire format version written into every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed size of the frame header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Default smoothing factor for the interpolator.
pub const DEFAULT_ALPHA: f32 = 0.3;

/// Default transition window between two modes, in seconds.
pub const DEFAULT_TRANSITION_SECS: f32 = 1.0;

/// Default target frame rate.
pub const DEFAULT_TARGET_FPS: f32 = 30.0;

/// Throwaway inferences run before the accelerator is declared ready.
pub const WARMUP_RUNS: usize = 3;

/// How long memoized host readings stay fresh, in milliseconds.
pub const HOST_CACHE_MS: u64 = 250;

/// Extraction time above which a debug line is emitted, in microseconds.
pub const EXTRACT_BUDGET_MICROS: u128 = 2_000;
