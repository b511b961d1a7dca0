//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file) is a
//! valid configuration. Load order: explicit path, then `LUMEN_CONFIG`, then
//! built-in defaults; `LUMEN_*` environment overrides are applied last.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};

use lumen_core::constants::HEADER_SIZE;
use lumen_core::{
    AcceleratorBackend, AttributeLayout, BackendFactory, EngineConfig, ModeCatalog, ReferenceAccelerator,
    VisualizationMode,
};

use crate::error::{Result, RuntimeError};

pub const CONFIG_ENV: &str = "LUMEN_CONFIG";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LumenConfig {
    pub pipeline: PipelineConfig,
    pub engine: EngineSection,
    pub morph: MorphConfig,
    pub features: FeaturesConfig,
    pub sink: SinkConfig,
    pub server: ServerConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub target_fps: f32,
    pub min_fps: f32,
    /// Interpolator smoothing factor in (0, 1].
    pub alpha: f32,
    pub attributes: AttributeLayout,
    /// Frames in the overrun window used by the governor.
    pub overrun_window: usize,
    /// Fraction of overrunning frames in a full window that triggers a slowdown.
    pub overrun_ratio: f32,
    /// Seed for the mode shape generators.
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_fps: lumen_core::DEFAULT_TARGET_FPS,
            min_fps: 10.0,
            alpha: lumen_core::DEFAULT_ALPHA,
            attributes: AttributeLayout::Full,
            overrun_window: 60,
            overrun_ratio: 0.5,
            seed: 0x5EED,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    /// `none` or `reference`.
    pub backend: String,
    pub inference_timeout_ms: u64,
    /// Seconds between recovery retries while in fallback; 0 disables them.
    pub retry_interval_secs: u64,
    pub warmup_runs: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            backend: "none".to_string(),
            inference_timeout_ms: 20,
            retry_interval_secs: 10,
            warmup_runs: lumen_core::constants::WARMUP_RUNS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MorphConfig {
    pub transition_secs: f32,
    /// Per-mode particle count overrides, keyed by mode name.
    pub counts: BTreeMap<String, usize>,
}

impl Default for MorphConfig {
    fn default() -> Self {
        Self {
            transition_secs: lumen_core::DEFAULT_TRANSITION_SECS,
            counts: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeaturesConfig {
    pub host_cache_ms: u64,
    /// Read host load from `/proc`. Off gives neutral host slots.
    pub host_sampling: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            host_cache_ms: lumen_core::constants::HOST_CACHE_MS,
            host_sampling: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    pub channel_capacity: usize,
    /// `host:port` to mirror frames to as UDP datagrams.
    pub udp: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 8,
            udp: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7878".to_string(),
        }
    }
}

impl LumenConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: LumenConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `path`, else `$LUMEN_CONFIG`, else defaults. Environment overrides
    /// are applied on top and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(|| env::var(CONFIG_ENV).ok().map(PathBuf::from));
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(&path).map_err(|e| {
                    RuntimeError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                tracing::debug!("loaded config from {}", path.display());
                toml::from_str(&content)?
            }
            None => LumenConfig::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `LUMEN_*` overrides read through `lookup`. Unparseable values
    /// are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("ignoring {key}={raw}: not a valid value");
                    None
                }
            }
        }

        if let Some(fps) = parsed("LUMEN_TARGET_FPS", lookup("LUMEN_TARGET_FPS")) {
            self.pipeline.target_fps = fps;
        }
        if let Some(backend) = lookup("LUMEN_BACKEND") {
            self.engine.backend = backend;
        }
        if let Some(listen) = lookup("LUMEN_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(udp) = lookup("LUMEN_UDP") {
            self.sink.udp = (!udp.is_empty()).then_some(udp);
        }
        if let Some(attrs) = parsed::<AttributeLayout>("LUMEN_ATTRIBUTES", lookup("LUMEN_ATTRIBUTES")) {
            self.pipeline.attributes = attrs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        let fail = |msg: String| Err(RuntimeError::Config(msg));
        if !(p.target_fps.is_finite() && p.target_fps > 0.0 && p.target_fps <= 240.0) {
            return fail(format!("pipeline.target_fps must be in (0, 240], got {}", p.target_fps));
        }
        if !(p.min_fps.is_finite() && p.min_fps > 0.0 && p.min_fps <= p.target_fps) {
            return fail(format!(
                "pipeline.min_fps must be in (0, target_fps], got {}",
                p.min_fps
            ));
        }
        if !(p.alpha > 0.0 && p.alpha <= 1.0) {
            return fail(format!("pipeline.alpha must be in (0, 1], got {}", p.alpha));
        }
        if p.overrun_window == 0 {
            return fail("pipeline.overrun_window must be at least 1".to_string());
        }
        if !(p.overrun_ratio > 0.0 && p.overrun_ratio <= 1.0) {
            return fail(format!("pipeline.overrun_ratio must be in (0, 1], got {}", p.overrun_ratio));
        }
        if !matches!(self.engine.backend.as_str(), "none" | "reference") {
            return fail(format!(
                "engine.backend must be 'none' or 'reference', got '{}'",
                self.engine.backend
            ));
        }
        if self.engine.warmup_runs == 0 {
            return fail("engine.warmup_runs must be at least 1".to_string());
        }
        if self.engine.inference_timeout_ms == 0 {
            return fail("engine.inference_timeout_ms must be positive".to_string());
        }
        if !(self.morph.transition_secs.is_finite() && self.morph.transition_secs > 0.0) {
            return fail(format!(
                "morph.transition_secs must be positive, got {}",
                self.morph.transition_secs
            ));
        }
        for (name, count) in &self.morph.counts {
            if let Err(e) = name.parse::<VisualizationMode>() {
                return fail(format!("morph.counts: {e}"));
            }
            if *count == 0 || *count > 1 << 20 {
                return fail(format!("morph.counts.{name} must be in 1..=1048576, got {count}"));
            }
        }
        if self.sink.channel_capacity == 0 {
            return fail("sink.channel_capacity must be at least 1".to_string());
        }
        Ok(())
    }

    /// Mode catalog with count overrides applied.
    pub fn catalog(&self) -> ModeCatalog {
        let counts = VisualizationMode::ALL.map(|mode| {
            self.morph
                .counts
                .iter()
                .find(|(name, _)| name.parse::<VisualizationMode>().ok() == Some(mode))
                .map(|(_, n)| *n)
                .unwrap_or(mode.default_count())
        });
        ModeCatalog::new(counts, self.pipeline.seed)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            inference_timeout: Duration::from_millis(self.engine.inference_timeout_ms),
            retry_interval: (self.engine.retry_interval_secs > 0)
                .then(|| Duration::from_secs(self.engine.retry_interval_secs)),
            warmup_runs: self.engine.warmup_runs,
        }
    }

    /// Factory for the configured accelerator, `None` for `backend = "none"`.
    pub fn backend_factory(&self) -> Result<Option<BackendFactory>> {
        match self.engine.backend.as_str() {
            "none" => Ok(None),
            "reference" => Ok(Some(Arc::new(|| {
                Ok(Box::new(ReferenceAccelerator::new()) as Box<dyn AcceleratorBackend>)
            }))),
            other => Err(RuntimeError::Config(format!("unknown engine.backend '{other}'"))),
        }
    }

    /// Size in bytes of the largest frame this configuration can encode.
    pub fn max_frame_bytes(&self) -> usize {
        let catalog = self.catalog();
        let particles = VisualizationMode::ALL
            .iter()
            .map(|mode| catalog.count(*mode))
            .max()
            .unwrap_or(0);
        HEADER_SIZE + particles * self.pipeline.attributes.k() * 4
    }

    pub fn transition(&self) -> Duration {
        Duration::from_secs_f32(self.morph.transition_secs)
    }
}
