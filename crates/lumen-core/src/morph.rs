//! Mode selection and cross-mode blending.
//!
//! The controller picks a [`VisualizationMode`] from the snapshot each frame
//! and, on a change, blends from a frozen copy of whatever was last emitted
//! toward the new mode over the transition window. Particle counts may differ
//! between the two sets; the previous set is sampled by proportional index.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::animate;
use crate::features::{FeatureVector, slots};
use crate::geometry::smoothstep;
use crate::modes::{ModeCatalog, VisualizationMode};
use crate::particle::{ParticleSet, ParticleTarget, RawParticleArray};
use crate::state::StateSnapshot;

/// Threat level at or above which Alert takes over.
pub const ALERT_THRESHOLD: f64 = 0.7;

/// Blend progress this close to 1.0 is treated as finished, absorbing
/// accumulated `frame_dt / duration` rounding.
const PROGRESS_SNAP: f32 = 1e-4;

/// Trigger table in priority order, highest first.
pub const TRIGGERS: [(VisualizationMode, &str); 5] = [
    (VisualizationMode::Alert, "threat.level >= 0.7 or threat.active == true"),
    (VisualizationMode::Presence, "interaction.user_present == true"),
    (VisualizationMode::Thinking, "cognitive.processing == true"),
    (VisualizationMode::Environment, "environment.mapping_active == true"),
    (VisualizationMode::Idle, "default"),
];

/// Path whose string value (a mode name) overrides every trigger.
pub const OVERRIDE_PATH: &str = "mode.override";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MorphState {
    pub current: VisualizationMode,
    pub previous: Option<VisualizationMode>,
    pub blend_progress: f32,
}

impl MorphState {
    pub fn is_blending(&self) -> bool {
        self.previous.is_some()
    }
}

impl Default for MorphState {
    fn default() -> Self {
        Self {
            current: VisualizationMode::Idle,
            previous: None,
            blend_progress: 1.0,
        }
    }
}

/// Evaluate the triggers against one snapshot.
pub fn select_mode(snapshot: &StateSnapshot) -> VisualizationMode {
    if let Some(name) = snapshot.get_str(OVERRIDE_PATH) {
        match name.parse::<VisualizationMode>() {
            Ok(mode) => return mode,
            Err(e) => tracing::debug!("ignoring {OVERRIDE_PATH}: {e}"),
        }
    }
    let threat = snapshot
        .get_f64("threat.level")
        .filter(|t| t.is_finite())
        .unwrap_or(0.0);
    if threat >= ALERT_THRESHOLD || snapshot.bool_or("threat.active", false) {
        VisualizationMode::Alert
    } else if snapshot.bool_or("interaction.user_present", false) {
        VisualizationMode::Presence
    } else if snapshot.bool_or("cognitive.processing", false) {
        VisualizationMode::Thinking
    } else if snapshot.bool_or("environment.mapping_active", false) {
        VisualizationMode::Environment
    } else {
        VisualizationMode::Idle
    }
}

/// Index in a set of `prev_len` that corresponds to index `i` of `cur_len`.
pub fn remap_index(i: usize, prev_len: usize, cur_len: usize) -> usize {
    if cur_len == 0 || prev_len == 0 {
        return 0;
    }
    ((i as u64 * prev_len as u64) / cur_len as u64) as usize
}

/// What committing a step does to the frozen starting set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Freeze {
    Keep,
    /// A new blend starts from whatever was last emitted.
    LastEmitted,
    Clear,
}

/// One frame's worth of mode and blend movement, computed by
/// [`MorphingController::plan`]. The controller only moves when the step is
/// handed back to [`MorphingController::commit`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MorphStep {
    state: MorphState,
    elapsed: f32,
    freeze: Freeze,
}

impl MorphStep {
    pub fn state(&self) -> MorphState {
        self.state
    }

    pub fn mode(&self) -> VisualizationMode {
        self.state.current
    }

    pub fn is_blending(&self) -> bool {
        self.state.is_blending()
    }

    pub fn blend_progress(&self) -> f32 {
        self.state.blend_progress
    }

    /// Animation time including this frame.
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }
}

pub struct MorphingController {
    catalog: Arc<ModeCatalog>,
    transition_secs: f32,
    state: MorphState,
    /// Frozen copy of what was on screen when the current transition began.
    previous_set: Option<ParticleSet>,
    last_emitted: Option<ParticleSet>,
    elapsed: f32,
}

impl MorphingController {
    pub fn new(catalog: Arc<ModeCatalog>, transition: Duration) -> Self {
        Self {
            catalog,
            transition_secs: transition.as_secs_f32().max(f32::EPSILON),
            state: MorphState::default(),
            previous_set: None,
            last_emitted: None,
            elapsed: 0.0,
        }
    }

    pub fn select_mode(&self, snapshot: &StateSnapshot) -> VisualizationMode {
        select_mode(snapshot)
    }

    pub fn state(&self) -> MorphState {
        self.state
    }

    pub fn current_mode(&self) -> VisualizationMode {
        self.state.current
    }

    pub fn blend_progress(&self) -> f32 {
        self.state.blend_progress
    }

    pub fn is_blending(&self) -> bool {
        self.state.is_blending()
    }

    /// Particle count the engine should produce for `mode`.
    pub fn count(&self, mode: VisualizationMode) -> usize {
        self.catalog.count(mode)
    }

    /// Seconds of animation time accumulated by committed frames.
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    /// Work out the move to `target` (a new blend if it differs from the
    /// current mode) and the blend step for `frame_dt`. Read-only.
    pub fn plan(&self, target: VisualizationMode, frame_dt: f32) -> MorphStep {
        let dt = if frame_dt.is_finite() { frame_dt.max(0.0) } else { 0.0 };
        let elapsed = self.elapsed + dt;

        if target != self.state.current {
            let on_screen = self.last_emitted.as_ref().is_some_and(|s| !s.is_empty());
            return if on_screen {
                MorphStep {
                    state: MorphState {
                        current: target,
                        previous: Some(self.state.current),
                        blend_progress: 0.0,
                    },
                    elapsed,
                    freeze: Freeze::LastEmitted,
                }
            } else {
                // Nothing on screen yet: cut straight to the target.
                MorphStep {
                    state: MorphState {
                        current: target,
                        ..MorphState::default()
                    },
                    elapsed,
                    freeze: Freeze::Clear,
                }
            };
        }

        let mut state = self.state;
        let mut freeze = Freeze::Keep;
        if state.previous.is_some() {
            let progress = state.blend_progress + dt / self.transition_secs;
            if progress >= 1.0 - PROGRESS_SNAP {
                state.blend_progress = 1.0;
                state.previous = None;
                freeze = Freeze::Clear;
            } else {
                state.blend_progress = progress;
            }
        }
        MorphStep { state, elapsed, freeze }
    }

    fn starting_set(&self, step: &MorphStep) -> Option<&ParticleSet> {
        if step.state.previous.is_none() {
            return None;
        }
        match step.freeze {
            Freeze::Keep => self.previous_set.as_ref(),
            Freeze::LastEmitted => self.last_emitted.as_ref(),
            Freeze::Clear => None,
        }
    }

    /// Turn smoothed positions into the frame's particles: palette from the
    /// step's template modulated by features, blended with the frozen
    /// starting set while a transition is running.
    pub fn compose(&self, step: &MorphStep, smoothed: &RawParticleArray, features: &FeatureVector) -> ParticleSet {
        let mode = step.mode();
        let template = self.catalog.template(mode);
        let n = smoothed.particle_count();

        let arousal = features.get(slots::AROUSAL);
        let energy = features.audio_energy();
        let pulse = if mode == VisualizationMode::Alert {
            animate::pulse(step.elapsed)
        } else {
            0.0
        };
        let size_gain = 1.0 + 0.2 * energy;
        let glow_gain = 0.6 + 0.4 * arousal;

        let current = smoothed.positions().enumerate().map(|(i, position)| {
            let base = template
                .get(remap_index(i, template.len(), n))
                .copied()
                .unwrap_or_else(|| ParticleTarget::new(position, [1.0; 3], 1.0, 0.5));
            let glow = (base.glow * glow_gain + 0.3 * energy).max(pulse);
            ParticleTarget::new(position, base.color, base.size * size_gain, glow)
        });

        match self.starting_set(step) {
            Some(prev) if !prev.is_empty() => {
                let t = smoothstep(step.state.blend_progress);
                current
                    .enumerate()
                    .map(|(i, cur)| match prev.get(remap_index(i, prev.len(), n)) {
                        Some(from) => from.lerp(&cur, t),
                        None => cur,
                    })
                    .collect()
            }
            _ => current.collect(),
        }
    }

    /// Apply `step` and record what was actually emitted. A retarget freezes
    /// the previously emitted set as the new starting point.
    pub fn commit(&mut self, step: MorphStep, emitted: ParticleSet) {
        match step.freeze {
            Freeze::Keep => {}
            Freeze::LastEmitted => {
                tracing::debug!("morph {} -> {}", self.state.current, step.state.current);
                self.previous_set = self.last_emitted.take();
            }
            Freeze::Clear => self.previous_set = None,
        }
        self.state = step.state;
        self.elapsed = step.elapsed;
        self.last_emitted = Some(emitted);
    }

    pub fn last_emitted(&self) -> Option<&ParticleSet> {
        self.last_emitted.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FEATURE_COUNT;
    use crate::value::Value;

    fn snap(entries: &[(&str, Value)]) -> StateSnapshot {
        StateSnapshot::from_entries(entries.iter().map(|(k, v)| (k.to_string(), v.clone())))
    }

    fn controller() -> MorphingController {
        MorphingController::new(Arc::new(ModeCatalog::scaled_down(64)), Duration::from_secs(1))
    }

    fn features() -> FeatureVector {
        FeatureVector::from_values([0.5; FEATURE_COUNT])
    }

    /// One frame with the template positions as engine output.
    fn frame(m: &mut MorphingController, target: VisualizationMode, dt: f32) -> ParticleSet {
        let step = m.plan(target, dt);
        let raw = RawParticleArray::new(m.catalog.template(step.mode()).positions_flat());
        let out = m.compose(&step, &raw, &features());
        m.commit(step, out.clone());
        out
    }

    #[test]
    fn test_trigger_priority() {
        assert_eq!(select_mode(&snap(&[])), VisualizationMode::Idle);
        assert_eq!(
            select_mode(&snap(&[("environment.mapping_active", Value::from(true))])),
            VisualizationMode::Environment
        );
        assert_eq!(
            select_mode(&snap(&[
                ("environment.mapping_active", Value::from(true)),
                ("cognitive.processing", Value::from(true)),
            ])),
            VisualizationMode::Thinking
        );
        assert_eq!(
            select_mode(&snap(&[
                ("cognitive.processing", Value::from(true)),
                ("interaction.user_present", Value::from(true)),
            ])),
            VisualizationMode::Presence
        );
        assert_eq!(
            select_mode(&snap(&[
                ("interaction.user_present", Value::from(true)),
                ("threat.level", Value::from(0.7)),
            ])),
            VisualizationMode::Alert
        );
        assert_eq!(
            select_mode(&snap(&[("threat.active", Value::from(true))])),
            VisualizationMode::Alert
        );
        assert_eq!(
            select_mode(&snap(&[("threat.level", Value::from(0.69))])),
            VisualizationMode::Idle
        );
    }

    #[test]
    fn test_override_beats_triggers() {
        let s = snap(&[
            ("threat.active", Value::from(true)),
            ("mode.override", Value::from("Environment")),
        ]);
        assert_eq!(select_mode(&s), VisualizationMode::Environment);
        let bad = snap(&[("mode.override", Value::from("disco")), ("threat.active", Value::from(true))]);
        assert_eq!(select_mode(&bad), VisualizationMode::Alert);
    }

    #[test]
    fn test_first_mode_change_without_history_is_a_cut() {
        let m = controller();
        let step = m.plan(VisualizationMode::Presence, 0.033);
        assert_eq!(step.mode(), VisualizationMode::Presence);
        assert!(!step.is_blending());
        assert_eq!(step.blend_progress(), 1.0);
    }

    #[test]
    fn test_uncommitted_step_leaves_controller_alone() {
        let mut m = controller();
        let dt = 0.1;
        frame(&mut m, VisualizationMode::Idle, dt);
        frame(&mut m, VisualizationMode::Idle, dt);
        let before = m.state();
        let elapsed = m.elapsed();

        let abandoned = m.plan(VisualizationMode::Presence, dt);
        assert!(abandoned.is_blending());
        assert_eq!(m.state(), before);
        assert_eq!(m.elapsed(), elapsed);

        frame(&mut m, VisualizationMode::Presence, dt);
        assert_eq!(m.state().previous, Some(VisualizationMode::Idle));
        assert_eq!(m.blend_progress(), 0.0);
        assert!((m.elapsed() - (elapsed + dt)).abs() < 1e-6);
    }

    #[test]
    fn test_blend_monotonic_and_reaches_one() {
        let mut m = controller();
        let dt = 1.0 / 30.0;
        for _ in 0..10 {
            frame(&mut m, VisualizationMode::Idle, dt);
        }
        frame(&mut m, VisualizationMode::Presence, dt);
        assert_eq!(m.state().previous, Some(VisualizationMode::Idle));
        assert_eq!(m.blend_progress(), 0.0);

        let mut last = 0.0;
        let mut frames = 0;
        while m.is_blending() {
            frame(&mut m, VisualizationMode::Presence, dt);
            frames += 1;
            assert!(m.blend_progress() >= last);
            last = m.blend_progress();
            assert!(frames <= 31, "blend did not finish");
        }
        assert_eq!(m.blend_progress(), 1.0);
        assert!((29..=31).contains(&frames));
        assert_eq!(m.state().previous, None);
    }

    #[test]
    fn test_first_blended_frame_equals_last_shown() {
        let mut m = controller();
        let shown = frame(&mut m, VisualizationMode::Idle, 0.033);
        let first = frame(&mut m, VisualizationMode::Thinking, 0.033);
        let n = first.len();
        for (i, p) in first.iter().enumerate() {
            assert_eq!(*p, shown.particles()[remap_index(i, shown.len(), n)]);
        }
    }

    #[test]
    fn test_no_discontinuous_jumps_during_blend() {
        let mut m = controller();
        let dt = 1.0 / 30.0;
        frame(&mut m, VisualizationMode::Idle, dt);
        let mut prev = frame(&mut m, VisualizationMode::Presence, dt);
        while m.is_blending() {
            let next = frame(&mut m, VisualizationMode::Presence, dt);
            let max_step = next
                .iter()
                .zip(prev.iter())
                .map(|(a, b)| a.position.distance(b.position))
                .fold(0.0f32, f32::max);
            // Steepest smoothstep slope is 1.5, shapes are a few units apart.
            assert!(max_step < 0.6, "jump of {max_step}");
            prev = next;
        }
    }

    #[test]
    fn test_retarget_mid_blend_freezes_partial_set() {
        let mut m = controller();
        let dt = 0.1;
        frame(&mut m, VisualizationMode::Idle, dt);
        frame(&mut m, VisualizationMode::Presence, dt);
        frame(&mut m, VisualizationMode::Presence, dt);
        let partial = frame(&mut m, VisualizationMode::Presence, dt);
        assert!(m.is_blending());

        let first = frame(&mut m, VisualizationMode::Alert, dt);
        assert_eq!(m.state().previous, Some(VisualizationMode::Presence));
        assert_eq!(m.blend_progress(), 0.0);
        for (i, p) in first.iter().enumerate() {
            assert_eq!(*p, partial.particles()[remap_index(i, partial.len(), first.len())]);
        }
    }

    #[test]
    fn test_remap_index_bounds() {
        assert_eq!(remap_index(0, 10, 20), 0);
        assert_eq!(remap_index(19, 10, 20), 9);
        assert_eq!(remap_index(4, 100, 5), 80);
        assert_eq!(remap_index(3, 0, 5), 0);
        for i in 0..97 {
            assert!(remap_index(i, 13, 97) < 13);
        }
    }

    #[test]
    fn test_compose_uses_current_count_and_palette() {
        let mut m = controller();
        let out = frame(&mut m, VisualizationMode::Alert, 0.0);
        assert_eq!(out.len(), m.count(m.current_mode()));
        assert!(out.iter().all(|p| p.color[0] == 1.0));
    }
}
