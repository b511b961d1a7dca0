//! Visualization modes and their shape generators.
//!
//! Each mode has a pure generator: same [`ModeParams`] in, same
//! [`ParticleSet`] out. Nothing here reads the clock; time-based motion is
//! layered on afterwards by [`crate::animate`].

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::constants::GOLDEN_ANGLE;
use crate::geometry::Vec3;
use crate::particle::{ParticleSet, ParticleTarget};

/// Closed set of particle-formation archetypes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationMode {
    /// Primary form at rest.
    Idle,
    /// Primary form facing a person: humanoid figure.
    Presence,
    /// Reconstruction of the surrounding room.
    Environment,
    /// Transition form while the system is busy.
    Thinking,
    /// Hazard flagged.
    Alert,
}

impl VisualizationMode {
    pub const ALL: [VisualizationMode; 5] = [
        VisualizationMode::Idle,
        VisualizationMode::Presence,
        VisualizationMode::Environment,
        VisualizationMode::Thinking,
        VisualizationMode::Alert,
    ];

    /// Identifier carried in the frame header.
    pub const fn wire_id(self) -> u8 {
        match self {
            VisualizationMode::Idle => 0,
            VisualizationMode::Presence => 1,
            VisualizationMode::Environment => 2,
            VisualizationMode::Thinking => 3,
            VisualizationMode::Alert => 4,
        }
    }

    pub const fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(VisualizationMode::Idle),
            1 => Some(VisualizationMode::Presence),
            2 => Some(VisualizationMode::Environment),
            3 => Some(VisualizationMode::Thinking),
            4 => Some(VisualizationMode::Alert),
            _ => None,
        }
    }

    pub const fn index(self) -> usize {
        self.wire_id() as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            VisualizationMode::Idle => "idle",
            VisualizationMode::Presence => "presence",
            VisualizationMode::Environment => "environment",
            VisualizationMode::Thinking => "thinking",
            VisualizationMode::Alert => "alert",
        }
    }

    pub const fn default_count(self) -> usize {
        match self {
            VisualizationMode::Idle => 8192,
            VisualizationMode::Presence => 12288,
            VisualizationMode::Environment => 16384,
            VisualizationMode::Thinking => 8192,
            VisualizationMode::Alert => 6144,
        }
    }
}

impl fmt::Display for VisualizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VisualizationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        VisualizationMode::ALL
            .into_iter()
            .find(|m| m.name() == lower)
            .ok_or_else(|| format!("unknown visualization mode '{s}'"))
    }
}

/// Inputs to a shape generator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModeParams {
    pub count: usize,
    pub seed: u64,
    pub scale: f32,
}

impl ModeParams {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            seed: 0x5EED,
            scale: 1.0,
        }
    }
}

/// Generate the base shape for `mode`.
pub fn generate(mode: VisualizationMode, params: &ModeParams) -> ParticleSet {
    let mut rng = SmallRng::seed_from_u64(params.seed ^ ((mode.wire_id() as u64) << 32));
    let particles = match mode {
        VisualizationMode::Idle => idle_sphere(params.count, &mut rng),
        VisualizationMode::Presence => humanoid(params.count, &mut rng),
        VisualizationMode::Environment => room(params.count, &mut rng),
        VisualizationMode::Thinking => vortex(params.count, &mut rng),
        VisualizationMode::Alert => warning(params.count, &mut rng),
    };
    particles
        .into_iter()
        .map(|mut p| {
            p.position = p.position * params.scale;
            p
        })
        .collect()
}

fn jitter(rng: &mut SmallRng, amount: f32) -> f32 {
    (rng.random::<f32>() * 2.0 - 1.0) * amount
}

fn random_unit(rng: &mut SmallRng) -> Vec3 {
    loop {
        let v = Vec3::new(jitter(rng, 1.0), jitter(rng, 1.0), jitter(rng, 1.0));
        let len = v.length();
        if len > 1e-3 && len <= 1.0 {
            return v * (1.0 / len);
        }
    }
}

/// Fibonacci sphere: even coverage, golden-angle azimuth steps.
fn idle_sphere(count: usize, rng: &mut SmallRng) -> Vec<ParticleTarget> {
    let radius = 1.6;
    (0..count)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f32 + 0.5) / count as f32;
            let ring = (1.0 - y * y).max(0.0).sqrt();
            let theta = (i as f64 * GOLDEN_ANGLE) as f32;
            let r = radius + jitter(rng, 0.03);
            let pos = Vec3::new(ring * theta.cos(), y, ring * theta.sin()) * r;
            let t = (y + 1.0) * 0.5;
            ParticleTarget::new(
                pos,
                [0.25 + 0.25 * t, 0.65 + 0.1 * t, 1.0],
                0.9 + jitter(rng, 0.1),
                0.4,
            )
        })
        .collect()
}

const HEAD: (Vec3, f32) = (Vec3::new(0.0, 0.95, 0.0), 0.18);

/// Skeleton bones as (from, to, thickness), standing upright and centered.
const BONES: [(Vec3, Vec3, f32); 13] = [
    (Vec3::new(0.0, 0.75, 0.0), Vec3::new(0.0, 0.4, 0.0), 0.08), // neck → chest
    (Vec3::new(0.0, 0.4, 0.0), Vec3::new(0.0, 0.05, 0.0), 0.14), // spine
    (Vec3::new(-0.35, 0.7, 0.0), Vec3::new(0.35, 0.7, 0.0), 0.07), // shoulders
    (Vec3::new(-0.35, 0.7, 0.0), Vec3::new(-0.55, 0.35, 0.05), 0.06),
    (Vec3::new(-0.55, 0.35, 0.05), Vec3::new(-0.6, 0.0, 0.1), 0.05),
    (Vec3::new(0.35, 0.7, 0.0), Vec3::new(0.55, 0.35, 0.05), 0.06),
    (Vec3::new(0.55, 0.35, 0.05), Vec3::new(0.6, 0.0, 0.1), 0.05),
    (Vec3::new(-0.18, 0.02, 0.0), Vec3::new(0.18, 0.02, 0.0), 0.09), // pelvis
    (Vec3::new(-0.18, 0.02, 0.0), Vec3::new(-0.2, -0.5, 0.03), 0.08),
    (Vec3::new(-0.2, -0.5, 0.03), Vec3::new(-0.22, -1.0, 0.08), 0.06),
    (Vec3::new(0.18, 0.02, 0.0), Vec3::new(0.2, -0.5, 0.03), 0.08),
    (Vec3::new(0.2, -0.5, 0.03), Vec3::new(0.22, -1.0, 0.08), 0.06),
    (Vec3::new(0.0, 0.75, 0.0), Vec3::new(0.0, 0.77, 0.0), 0.05), // head joint
];

/// Split `total` across weights so the parts sum exactly to `total`.
fn allocate(total: usize, weights: &[f32]) -> Vec<usize> {
    let sum: f32 = weights.iter().sum();
    let mut parts: Vec<usize> = weights
        .iter()
        .map(|w| ((w / sum) * total as f32).floor() as usize)
        .collect();
    let assigned: usize = parts.iter().sum();
    if let Some(last) = parts.last_mut() {
        *last += total.saturating_sub(assigned);
    }
    parts
}

fn humanoid(count: usize, rng: &mut SmallRng) -> Vec<ParticleTarget> {
    let head_count = count / 5;
    let lengths: Vec<f32> = BONES.iter().map(|(a, b, _)| a.distance(*b).max(0.02)).collect();
    let per_bone = allocate(count - head_count, &lengths);
    let mut out = Vec::with_capacity(count);

    let (center, radius) = HEAD;
    for _ in 0..head_count {
        let pos = center + random_unit(rng) * (radius * (0.85 + 0.15 * rng.random::<f32>()));
        out.push(ParticleTarget::new(pos, [1.0, 0.8, 0.55], 1.0, 0.7));
    }

    for ((from, to, thickness), n) in BONES.iter().zip(per_bone) {
        for _ in 0..n {
            let t = rng.random::<f32>();
            let offset = random_unit(rng) * (thickness * rng.random::<f32>().sqrt());
            let pos = from.lerp(*to, t) + offset;
            out.push(ParticleTarget::new(pos, [1.0, 0.72, 0.45], 0.9 + jitter(rng, 0.1), 0.6));
        }
    }
    out
}

fn room(count: usize, rng: &mut SmallRng) -> Vec<ParticleTarget> {
    let (half_w, half_d, floor, ceiling) = (4.0f32, 3.0f32, -1.5f32, 1.5f32);
    let floor_count = count / 2;
    let side = (floor_count as f32).sqrt().ceil().max(1.0) as usize;
    let mut out = Vec::with_capacity(count);

    for i in 0..floor_count {
        let gx = (i % side) as f32 / (side.max(2) - 1) as f32;
        let gz = (i / side) as f32 / (side.max(2) - 1) as f32;
        let pos = Vec3::new(
            -half_w + gx * 2.0 * half_w,
            floor,
            (-half_d + gz * 2.0 * half_d).min(half_d),
        );
        out.push(ParticleTarget::new(pos, [0.2, 0.6, 0.5], 0.7, 0.25));
    }

    for i in 0..count - floor_count {
        let y = floor + rng.random::<f32>() * (ceiling - floor);
        let pos = match i % 3 {
            0 => Vec3::new(jitter(rng, half_w), y, -half_d),
            1 => Vec3::new(-half_w, y, jitter(rng, half_d)),
            _ => Vec3::new(half_w, y, jitter(rng, half_d)),
        };
        out.push(ParticleTarget::new(pos, [0.4, 0.5, 0.85], 0.8, 0.3));
    }
    out
}

fn vortex(count: usize, rng: &mut SmallRng) -> Vec<ParticleTarget> {
    let (major, minor) = (1.4f32, 0.45f32);
    (0..count)
        .map(|i| {
            let u = std::f32::consts::TAU * i as f32 / count as f32;
            let v = (i as f64 * GOLDEN_ANGLE) as f32;
            let r = minor * (0.8 + 0.2 * rng.random::<f32>());
            let ring = major + r * v.cos();
            let pos = Vec3::new(ring * u.cos(), r * v.sin(), ring * u.sin());
            ParticleTarget::new(pos, [0.6, 0.4, 1.0], 0.8, 0.7)
        })
        .collect()
}

fn warning(count: usize, rng: &mut SmallRng) -> Vec<ParticleTarget> {
    let pillar_count = count * 3 / 10;
    let ring_count = count - pillar_count;
    let radii = [1.0f32, 1.8, 2.6];
    let per_ring = allocate(ring_count, &radii);
    let mut out = Vec::with_capacity(count);

    for (radius, n) in radii.iter().zip(per_ring) {
        for j in 0..n {
            let a = std::f32::consts::TAU * j as f32 / n.max(1) as f32;
            let pos = Vec3::new(radius * a.cos(), jitter(rng, 0.04), radius * a.sin());
            out.push(ParticleTarget::new(pos, [1.0, 0.15, 0.1], 1.2, 0.9));
        }
    }

    // Exclamation mark: a bar and a dot beneath it.
    let dot_count = pillar_count / 5;
    for j in 0..pillar_count {
        let pos = if j < dot_count {
            Vec3::new(0.0, -0.1, 0.0) + random_unit(rng) * (0.12 * rng.random::<f32>())
        } else {
            Vec3::new(jitter(rng, 0.08), 0.2 + rng.random::<f32>() * 1.6, jitter(rng, 0.08))
        };
        out.push(ParticleTarget::new(pos, [1.0, 0.35, 0.15], 1.3, 1.0));
    }
    out
}

/// Declared particle counts plus lazily generated base shapes.
///
/// Shared between the fallback engine and the morphing controller so each
/// shape is generated once per process.
#[derive(Debug)]
pub struct ModeCatalog {
    counts: [usize; 5],
    seed: u64,
    templates: [OnceLock<Arc<ParticleSet>>; 5],
}

impl ModeCatalog {
    pub fn new(counts: [usize; 5], seed: u64) -> Self {
        Self {
            counts,
            seed,
            templates: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    /// Catalog with every count divided by `divisor` (at least 1 particle).
    pub fn scaled_down(divisor: usize) -> Self {
        let divisor = divisor.max(1);
        Self::new(
            VisualizationMode::ALL.map(|m| (m.default_count() / divisor).max(1)),
            ModeParams::new(0).seed,
        )
    }

    pub fn count(&self, mode: VisualizationMode) -> usize {
        self.counts[mode.index()]
    }

    pub fn params(&self, mode: VisualizationMode) -> ModeParams {
        ModeParams {
            count: self.count(mode),
            seed: self.seed,
            scale: 1.0,
        }
    }

    pub fn template(&self, mode: VisualizationMode) -> Arc<ParticleSet> {
        Arc::clone(
            self.templates[mode.index()]
                .get_or_init(|| Arc::new(generate(mode, &self.params(mode)))),
        )
    }
}

impl Default for ModeCatalog {
    fn default() -> Self {
        Self::new(
            VisualizationMode::ALL.map(VisualizationMode::default_count),
            ModeParams::new(0).seed,
        )
    }
}
