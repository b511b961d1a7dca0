//! Time-based motion layered over engine output.
//!
//! Parameterized only by elapsed seconds, so the same inputs always give the
//! same frame.

use std::f32::consts::TAU;

use crate::constants::WORKING_RADIUS;
use crate::geometry::{Quaternion, Vec3};
use crate::modes::VisualizationMode;
use crate::particle::RawParticleArray;

const BREATH_HZ: f32 = 0.25;
const BREATH_DEPTH: f32 = 0.02;
const SWAY_HZ: f32 = 0.1;
const PULSE_HZ: f32 = 1.5;
const PULSE_DEPTH: f32 = 0.08;
const SPIN_RAD_PER_SEC: f32 = 0.8;

const UP: Vec3 = Vec3::new(0.0, 1.0, 0.0);

/// Slow radial scale oscillation around 1.0.
pub fn breathing(elapsed: f32) -> f32 {
    1.0 + BREATH_DEPTH * (TAU * BREATH_HZ * elapsed).sin()
}

/// Alert throb in [0, 1], also used to drive glow.
pub fn pulse(elapsed: f32) -> f32 {
    (TAU * PULSE_HZ * elapsed).sin().max(0.0)
}

fn sway(amplitude: f32, elapsed: f32) -> Quaternion {
    Quaternion::from_axis_angle(UP, amplitude * (TAU * SWAY_HZ * elapsed).sin())
}

/// Apply the mode's motion to `raw` in place.
pub fn animate(mode: VisualizationMode, raw: &mut RawParticleArray, elapsed: f32) {
    let (scale, rotation) = match mode {
        VisualizationMode::Idle => (breathing(elapsed), Some(sway(0.15, elapsed))),
        VisualizationMode::Presence => (breathing(elapsed), Some(sway(0.05, elapsed))),
        VisualizationMode::Environment => (1.0, None),
        VisualizationMode::Thinking => (
            breathing(elapsed),
            Some(Quaternion::from_axis_angle(UP, SPIN_RAD_PER_SEC * elapsed)),
        ),
        VisualizationMode::Alert => (1.0 + PULSE_DEPTH * pulse(elapsed), None),
    };
    if scale == 1.0 && rotation.is_none() {
        return;
    }
    for chunk in raw.as_mut_slice().chunks_exact_mut(3) {
        let Some(p) = Vec3::from_slice(chunk) else {
            continue;
        };
        let mut p = p * scale;
        if let Some(q) = rotation {
            p = q.rotate(p);
        }
        for (dst, c) in chunk.iter_mut().zip(p.to_array()) {
            *dst = c.clamp(-WORKING_RADIUS, WORKING_RADIUS);
        }
    }
}
