//! Software predictor: rule-based deformation of the mode templates.
//!
//! Neutral features reproduce the template exactly. Each rule only bends the
//! shape, so the result still reads as the mode's archetype.

use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::{GOLDEN_ANGLE, WORKING_RADIUS};
use crate::engine::{BackendError, ParticlePredictor};
use crate::features::{FeatureVector, slots};
use crate::geometry::Vec3;
use crate::modes::{ModeCatalog, ModeParams, VisualizationMode, generate};
use crate::particle::{ParticleSet, RawParticleArray};

pub struct FallbackPredictor {
    catalog: Arc<ModeCatalog>,
    /// Shapes generated for counts other than the catalog's.
    resized: HashMap<(VisualizationMode, usize), Arc<ParticleSet>>,
}

impl FallbackPredictor {
    pub fn new(catalog: Arc<ModeCatalog>) -> Self {
        Self {
            catalog,
            resized: HashMap::new(),
        }
    }

    fn template(&mut self, mode: VisualizationMode, count: usize) -> Arc<ParticleSet> {
        if self.catalog.count(mode) == count {
            return self.catalog.template(mode);
        }
        let catalog = &self.catalog;
        Arc::clone(self.resized.entry((mode, count)).or_insert_with(|| {
            Arc::new(generate(
                mode,
                &ModeParams {
                    count,
                    ..catalog.params(mode)
                },
            ))
        }))
    }
}

/// Per-frame deformation parameters derived from features.
struct Deform {
    /// Radial scale from arousal.
    scale: f32,
    /// Vertical stretch from valence.
    stretch: f32,
    /// Radial ripple amplitude from audio energy.
    ripple: f32,
    /// Tangential shake amplitude from threat level.
    shake: f32,
    /// Forward lean from attention.
    lean: f32,
}

impl Deform {
    fn from_features(f: &FeatureVector) -> Self {
        Self {
            scale: 1.0 + 0.25 * (f.get(slots::AROUSAL) - 0.5),
            stretch: 1.0 + 0.2 * (f.get(slots::VALENCE) - 0.5),
            ripple: 0.15 * f.audio_energy(),
            shake: 0.2 * f.get(slots::THREAT_LEVEL),
            lean: 0.3 * (f.get(slots::ATTENTION) - 0.5),
        }
    }

    fn apply(&self, i: usize, p: Vec3) -> Vec3 {
        let phase = (i as f64 * GOLDEN_ANGLE) as f32;
        let radial = self.scale * (1.0 + self.ripple * phase.sin());
        let mut out = Vec3::new(p.x * radial, p.y * radial * self.stretch, p.z * radial);
        if self.shake > 0.0 {
            out = out + Vec3::new(phase.cos(), (phase * 1.7).sin(), phase.sin()) * self.shake;
        }
        out.z += self.lean;
        out
    }
}

impl ParticlePredictor for FallbackPredictor {
    fn name(&self) -> &str {
        "fallback"
    }

    fn predict(
        &mut self,
        features: &FeatureVector,
        mode: VisualizationMode,
        count: usize,
    ) -> Result<RawParticleArray, BackendError> {
        let template = self.template(mode, count);
        if template.len() != count {
            return Err(BackendError::OutputShape {
                expected: count * 3,
                got: template.len() * 3,
            });
        }
        let deform = Deform::from_features(features);
        let mut values = Vec::with_capacity(count * 3);
        for (i, p) in template.iter().enumerate() {
            let q = deform.apply(i, p.position);
            values.extend(q.to_array().map(|c| c.clamp(-WORKING_RADIUS, WORKING_RADIUS)));
        }
        Ok(RawParticleArray::new(values))
    }
}
