//! Integer reference backend.
//!
//! Serves quantized template coordinates scaled by the arousal code, so the
//! accelerated path can run end to end without a device.

use std::collections::HashMap;

use crate::accelerator::AcceleratorBackend;
use crate::constants::FEATURE_COUNT;
use crate::engine::BackendError;
use crate::features::slots;
use crate::modes::{ModeParams, VisualizationMode, generate};
use crate::quantize::OUTPUT_QUANT;

#[derive(Debug, Default)]
pub struct ReferenceAccelerator {
    ready: bool,
    codes: HashMap<(VisualizationMode, usize), Vec<i8>>,
}

impl ReferenceAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn template_codes(&mut self, mode: VisualizationMode, count: usize) -> &[i8] {
        self.codes.entry((mode, count)).or_insert_with(|| {
            generate(mode, &ModeParams::new(count))
                .iter()
                .flat_map(|p| p.position.to_array())
                .map(|c| OUTPUT_QUANT.quantize_i8(c))
                .collect()
        })
    }
}

impl AcceleratorBackend for ReferenceAccelerator {
    fn name(&self) -> &str {
        "reference"
    }

    fn initialize(&mut self) -> Result<(), BackendError> {
        self.ready = true;
        Ok(())
    }

    fn invoke(
        &mut self,
        mode: VisualizationMode,
        input: &[u8],
        output: &mut [i8],
    ) -> Result<(), BackendError> {
        if !self.ready {
            return Err(BackendError::Invoke("not initialized".into()));
        }
        if input.len() != FEATURE_COUNT {
            return Err(BackendError::Invoke(format!(
                "expected {FEATURE_COUNT} input codes, got {}",
                input.len()
            )));
        }
        if output.len() % 3 != 0 {
            return Err(BackendError::OutputShape {
                expected: output.len() / 3 * 3,
                got: output.len(),
            });
        }
        // 224 is unity gain at the neutral arousal code (128).
        let gain = 224 + (input[slots::AROUSAL] as i32 - 128) / 4;
        let template = self.template_codes(mode, output.len() / 3);
        for (out, &code) in output.iter_mut().zip(template) {
            *out = (code as i32 * gain / 224).clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.ready = false;
        self.codes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(arousal: u8) -> Vec<u8> {
        let mut v = vec![128u8; FEATURE_COUNT];
        v[slots::AROUSAL] = arousal;
        v
    }

    #[test]
    fn test_requires_initialize() {
        let mut backend = ReferenceAccelerator::new();
        let mut out = vec![0i8; 30];
        assert!(backend.invoke(VisualizationMode::Idle, &input(128), &mut out).is_err());
        backend.initialize().unwrap();
        assert!(backend.invoke(VisualizationMode::Idle, &input(128), &mut out).is_ok());
    }

    #[test]
    fn test_neutral_arousal_is_unity_gain() {
        let mut backend = ReferenceAccelerator::new();
        backend.initialize().unwrap();
        let mut out = vec![0i8; 300];
        backend.invoke(VisualizationMode::Presence, &input(128), &mut out).unwrap();
        assert_eq!(out, backend.template_codes(VisualizationMode::Presence, 100));
    }

    #[test]
    fn test_arousal_scales_codes() {
        let mut backend = ReferenceAccelerator::new();
        backend.initialize().unwrap();
        let mut calm = vec![0i8; 300];
        let mut excited = vec![0i8; 300];
        backend.invoke(VisualizationMode::Idle, &input(0), &mut calm).unwrap();
        backend.invoke(VisualizationMode::Idle, &input(255), &mut excited).unwrap();
        let mag = |v: &[i8]| v.iter().map(|c| (*c as i32).abs()).sum::<i32>();
        assert!(mag(&excited) > mag(&calm));
    }

    #[test]
    fn test_rejects_wrong_input_length() {
        let mut backend = ReferenceAccelerator::new();
        backend.initialize().unwrap();
        let mut out = vec![0i8; 3];
        assert!(backend.invoke(VisualizationMode::Idle, &[0u8; 4], &mut out).is_err());
    }
}
