//! Exponential moving average over successive raw particle arrays.

use crate::constants::DEFAULT_ALPHA;
use crate::particle::RawParticleArray;

/// `smoothed[i] = α·current[i] + (1−α)·previous[i]`.
///
/// The first array, and any array whose length differs from the stored one,
/// passes through unchanged. `preview` computes without touching the stored
/// state so a frame that fails later can be abandoned.
#[derive(Clone, Debug)]
pub struct Interpolator {
    alpha: f32,
    previous: Option<Vec<f32>>,
}

impl Interpolator {
    /// `alpha` is clamped into (0, 1]; values ≤ 0 would freeze the output.
    pub fn new(alpha: f32) -> Self {
        let alpha = if alpha.is_finite() { alpha.clamp(f32::EPSILON, 1.0) } else { DEFAULT_ALPHA };
        Self { alpha, previous: None }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn has_history(&self) -> bool {
        self.previous.is_some()
    }

    pub fn preview(&self, raw: &RawParticleArray) -> RawParticleArray {
        let current = raw.as_slice();
        match &self.previous {
            Some(prev) if prev.len() == current.len() => {
                let a = self.alpha;
                RawParticleArray::new(
                    current
                        .iter()
                        .zip(prev)
                        .map(|(c, p)| a * c + (1.0 - a) * p)
                        .collect(),
                )
            }
            _ => raw.clone(),
        }
    }

    pub fn commit(&mut self, smoothed: &RawParticleArray) {
        match &mut self.previous {
            Some(prev) if prev.len() == smoothed.as_slice().len() => {
                prev.copy_from_slice(smoothed.as_slice());
            }
            _ => self.previous = Some(smoothed.as_slice().to_vec()),
        }
    }

    pub fn update(&mut self, raw: &RawParticleArray) -> RawParticleArray {
        let smoothed = self.preview(raw);
        self.commit(&smoothed);
        smoothed
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn raw(v: &[f32]) -> RawParticleArray {
        RawParticleArray::new(v.to_vec())
    }

    #[test]
    fn test_first_call_passes_through() {
        let mut interp = Interpolator::default();
        let out = interp.update(&raw(&[1.0, 2.0, 3.0]));
        assert_eq!(out.as_slice(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_blend_formula() {
        let mut interp = Interpolator::new(0.3);
        interp.update(&raw(&[0.0, 0.0, 0.0]));
        let out = interp.update(&raw(&[10.0, -10.0, 1.0]));
        assert_relative_eq!(out.as_slice()[0], 3.0);
        assert_relative_eq!(out.as_slice()[1], -3.0);
        assert_relative_eq!(out.as_slice()[2], 0.3);
    }

    #[test]
    fn test_length_change_passes_through() {
        let mut interp = Interpolator::default();
        interp.update(&raw(&[5.0, 5.0, 5.0]));
        let out = interp.update(&raw(&[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]));
        assert_eq!(out.as_slice(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_preview_does_not_commit() {
        let mut interp = Interpolator::new(0.5);
        interp.update(&raw(&[0.0, 0.0, 0.0]));
        let _ = interp.preview(&raw(&[100.0, 100.0, 100.0]));
        let out = interp.update(&raw(&[2.0, 2.0, 2.0]));
        assert_eq!(out.as_slice(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut interp = Interpolator::default();
        interp.update(&raw(&[9.0, 9.0, 9.0]));
        interp.reset();
        assert!(!interp.has_history());
        assert_eq!(interp.update(&raw(&[1.0, 1.0, 1.0])).as_slice(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_converges_under_constant_input() {
        for alpha in [0.05f32, 0.3, 0.7, 0.99] {
            let mut interp = Interpolator::new(alpha);
            interp.update(&raw(&[-4.0, 0.0, 4.0]));
            let target = raw(&[1.0, 2.0, 3.0]);
            let mut last_err = f32::INFINITY;
            for _ in 0..400 {
                let out = interp.update(&target);
                let err = out
                    .as_slice()
                    .iter()
                    .zip(target.as_slice())
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0f32, f32::max);
                assert!(err <= last_err + 1e-6, "alpha {alpha}: error grew");
                last_err = err;
            }
            assert!(last_err < 1e-3, "alpha {alpha}: residual {last_err}");
        }
    }

    #[test]
    fn test_alpha_is_sanitized() {
        assert_eq!(Interpolator::new(f32::NAN).alpha(), DEFAULT_ALPHA);
        assert_eq!(Interpolator::new(3.0).alpha(), 1.0);
        assert!(Interpolator::new(-1.0).alpha() > 0.0);
    }
}
