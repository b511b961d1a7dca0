use serde::{Deserialize, Serialize};

use crate::geometry::{Vec3, lerp};

/// Desired attributes for one particle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleTarget {
    pub position: Vec3,
    /// RGB, each channel in [0, 1].
    pub color: [f32; 3],
    pub size: f32,
    pub glow: f32,
}

impl ParticleTarget {
    pub fn new(position: Vec3, color: [f32; 3], size: f32, glow: f32) -> Self {
        Self {
            position,
            color: color.map(|c| c.clamp(0.0, 1.0)),
            size: size.max(0.0),
            glow: glow.clamp(0.0, 1.0),
        }
    }

    /// Component-wise interpolation of every attribute.
    pub fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            position: self.position.lerp(other.position, t),
            color: [
                lerp(self.color[0], other.color[0], t),
                lerp(self.color[1], other.color[1], t),
                lerp(self.color[2], other.color[2], t),
            ],
            size: lerp(self.size, other.size, t),
            glow: lerp(self.glow, other.glow, t),
        }
    }
}

/// Ordered, fixed-size array of particle targets for one mode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticleSet {
    particles: Vec<ParticleTarget>,
}

impl ParticleSet {
    pub fn new(particles: Vec<ParticleTarget>) -> Self {
        Self { particles }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &[ParticleTarget] {
        &self.particles
    }

    pub fn get(&self, i: usize) -> Option<&ParticleTarget> {
        self.particles.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParticleTarget> {
        self.particles.iter()
    }

    /// Flat `[x, y, z, x, y, z, ...]` view of the positions.
    pub fn positions_flat(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.particles.len() * 3);
        for p in &self.particles {
            out.extend_from_slice(&p.position.to_array());
        }
        out
    }

    /// Largest coordinate magnitude on any axis.
    pub fn max_extent(&self) -> f32 {
        self.particles
            .iter()
            .flat_map(|p| p.position.to_array())
            .fold(0.0f32, |acc, c| acc.max(c.abs()))
    }
}

impl FromIterator<ParticleTarget> for ParticleSet {
    fn from_iter<I: IntoIterator<Item = ParticleTarget>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Engine output: `3 × N` floats, reconstructible as N positions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawParticleArray {
    values: Vec<f32>,
}

impl RawParticleArray {
    /// Wrap a flat array. The length must be a multiple of three.
    pub fn new(values: Vec<f32>) -> Self {
        debug_assert!(values.len() % 3 == 0, "raw array length {} not a multiple of 3", values.len());
        Self { values }
    }

    pub fn particle_count(&self) -> usize {
        self.values.len() / 3
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn position(&self, i: usize) -> Option<Vec3> {
        self.values.get(i * 3..i * 3 + 3).and_then(Vec3::from_slice)
    }

    pub fn positions(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.values.chunks_exact(3).map(|c| Vec3::new(c[0], c[1], c[2]))
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }

    /// True when every value is finite and within ±`radius`.
    pub fn within(&self, radius: f32) -> bool {
        self.values
            .iter()
            .all(|v| v.is_finite() && v.abs() <= radius + f32::EPSILON)
    }
}
