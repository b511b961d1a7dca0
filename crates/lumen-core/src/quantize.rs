//! Affine 8-bit quantization used at the accelerator boundary.
//!
//! `q = round(x / scale + zero_point)` clamped to the integer range, and
//! `x = (q - zero_point) * scale` on the way back.

use crate::constants::WORKING_RADIUS;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

/// Features are in [0, 1] and go in as `u8`.
pub const INPUT_QUANT: QuantParams = QuantParams {
    scale: 1.0 / 255.0,
    zero_point: 0,
};

/// Coordinates are in ±[`WORKING_RADIUS`] and come out as `i8`. Code -128
/// lies one step past the radius and is clamped back on dequantization.
pub const OUTPUT_QUANT: QuantParams = QuantParams {
    scale: WORKING_RADIUS / 127.0,
    zero_point: 0,
};

impl QuantParams {
    fn code(self, x: f32, lo: i32, hi: i32) -> i32 {
        if x.is_nan() {
            return self.zero_point.clamp(lo, hi);
        }
        let q = (x / self.scale).round() + self.zero_point as f32;
        (q.clamp(lo as f32, hi as f32)) as i32
    }

    pub fn quantize_u8(self, x: f32) -> u8 {
        self.code(x, u8::MIN as i32, u8::MAX as i32) as u8
    }

    pub fn quantize_i8(self, x: f32) -> i8 {
        self.code(x, i8::MIN as i32, i8::MAX as i32) as i8
    }

    pub fn dequantize(self, q: i32) -> f32 {
        (q - self.zero_point) as f32 * self.scale
    }

    /// Worst-case reconstruction error for in-range values.
    pub fn step_error(self) -> f32 {
        self.scale * 0.5
    }
}

pub fn quantize_input(features: &[f32], out: &mut Vec<u8>) {
    out.clear();
    out.extend(features.iter().map(|&x| INPUT_QUANT.quantize_u8(x)));
}

/// Codes back to coordinates, clamped to ±[`WORKING_RADIUS`].
pub fn dequantize_output(codes: &[i8], out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        codes
            .iter()
            .map(|&q| OUTPUT_QUANT.dequantize(q as i32).clamp(-WORKING_RADIUS, WORKING_RADIUS)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_endpoints() {
        assert_eq!(INPUT_QUANT.quantize_u8(0.0), 0);
        assert_eq!(INPUT_QUANT.quantize_u8(1.0), 255);
        assert!((127..=128).contains(&INPUT_QUANT.quantize_u8(0.5)));
        assert_eq!(INPUT_QUANT.quantize_u8(-3.0), 0);
        assert_eq!(INPUT_QUANT.quantize_u8(9.0), 255);
        assert_eq!(INPUT_QUANT.quantize_u8(f32::NAN), 0);
    }

    #[test]
    fn test_output_saturates_at_working_radius() {
        assert_eq!(OUTPUT_QUANT.quantize_i8(WORKING_RADIUS), 127);
        assert_eq!(OUTPUT_QUANT.quantize_i8(-WORKING_RADIUS * 3.0), -128);
        assert!((OUTPUT_QUANT.dequantize(127) - WORKING_RADIUS).abs() < 1e-5);
    }

    #[test]
    fn test_roundtrip_within_half_step() {
        for i in 0..=1000 {
            let x = i as f32 / 1000.0;
            let back = INPUT_QUANT.dequantize(INPUT_QUANT.quantize_u8(x) as i32);
            assert!((back - x).abs() <= INPUT_QUANT.step_error() + 1e-6, "{x} -> {back}");
        }
        for i in -600..=600 {
            let x = i as f32 / 100.0;
            let back = OUTPUT_QUANT.dequantize(OUTPUT_QUANT.quantize_i8(x) as i32);
            assert!((back - x).abs() <= OUTPUT_QUANT.step_error() + 1e-5, "{x} -> {back}");
        }
    }

    #[test]
    fn test_slice_helpers_reuse_buffers() {
        let mut codes = vec![7u8; 10];
        quantize_input(&[0.0, 1.0], &mut codes);
        assert_eq!(codes, vec![0, 255]);
        let mut coords = Vec::new();
        dequantize_output(&[0, 127, -127], &mut coords);
        assert_eq!(coords.len(), 3);
        assert_eq!(coords[0], 0.0);
        assert!((coords[2] + WORKING_RADIUS).abs() < 1e-5);
    }

    #[test]
    fn test_lowest_code_stays_inside_radius() {
        assert!(OUTPUT_QUANT.dequantize(i8::MIN as i32) < -WORKING_RADIUS);
        let mut coords = Vec::new();
        dequantize_output(&[i8::MIN, i8::MAX], &mut coords);
        assert_eq!(coords[0], -WORKING_RADIUS);
        assert!(coords[1] <= WORKING_RADIUS && coords[1] > WORKING_RADIUS - 1e-5);
    }
}
