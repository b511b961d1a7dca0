use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::constants::EPSILON;

/// Point or direction in the working volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Self {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector, or zero for a near-zero input.
    pub fn normalize(self) -> Self {
        let len = self.length();
        if len < EPSILON {
            return Self::ZERO;
        }
        self * (1.0 / len)
    }

    pub fn lerp(self, other: Self, t: f32) -> Self {
        self + (other - self) * t
    }

    pub fn distance(self, other: Self) -> f32 {
        (other - self).length()
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    /// Exactly three components, or `None`.
    pub fn from_slice(s: &[f32]) -> Option<Self> {
        match *s {
            [x, y, z] => Some(Self::new(x, y, z)),
            _ => None,
        }
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Unit quaternion used as a 3D rotation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl PartialEq for Quaternion {
    fn eq(&self, other: &Self) -> bool {
        (self.w - other.w).abs() < EPSILON
            && (self.x - other.x).abs() < EPSILON
            && (self.y - other.y).abs() < EPSILON
            && (self.z - other.z).abs() < EPSILON
    }
}

impl Quaternion {
    pub fn identity() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    /// Rotation of `angle` radians about `axis`. A zero axis gives identity.
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        let axis = axis.normalize();
        if axis == Vec3::ZERO {
            return Self::identity();
        }
        let (sin_half, cos_half) = (angle * 0.5).sin_cos();
        Self {
            w: cos_half,
            x: axis.x * sin_half,
            y: axis.y * sin_half,
            z: axis.z * sin_half,
        }
    }

    /// Normalize to unit length. Returns identity if near-zero magnitude.
    pub fn normalize(self) -> Self {
        let norm = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if norm < EPSILON {
            return Self::identity();
        }
        Self {
            w: self.w / norm,
            x: self.x / norm,
            y: self.y / norm,
            z: self.z / norm,
        }
    }

    pub fn conjugate(self) -> Self {
        Self {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    /// Rotate a vector: q · v · q*, expanded to avoid building pure quaternions.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let u = Vec3::new(self.x, self.y, self.z);
        let t = u.cross(v) * 2.0;
        v + t * self.w + u.cross(t)
    }
}

/// Hamilton product (quaternion multiplication).
impl Mul for Quaternion {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self {
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        }
    }
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Hermite smoothstep on [0, 1]: 3t² − 2t³. Monotonic, flat at both ends.
pub fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::{FRAC_PI_2, PI};

    fn assert_vec_eq(a: Vec3, b: Vec3) {
        assert!(
            a.distance(b) < 1e-5,
            "vectors differ: {a:?} vs {b:?}"
        );
    }

    #[test]
    fn test_rotate_quarter_turn_about_y() {
        let q = Quaternion::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), FRAC_PI_2);
        let v = q.rotate(Vec3::new(1.0, 0.0, 0.0));
        assert_vec_eq(v, Vec3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn test_rotation_preserves_length() {
        let q = Quaternion::from_axis_angle(Vec3::new(1.0, 2.0, 3.0), 0.7);
        let v = Vec3::new(-2.0, 0.5, 4.0);
        assert_relative_eq!(q.rotate(v).length(), v.length(), epsilon = 1e-5);
    }

    #[test]
    fn test_hamilton_product_composes_rotations() {
        let axis = Vec3::new(0.0, 0.0, 1.0);
        let a = Quaternion::from_axis_angle(axis, 0.4);
        let b = Quaternion::from_axis_angle(axis, 0.6);
        let v = Vec3::new(1.0, 0.0, 0.0);
        assert_vec_eq((a * b).rotate(v), Quaternion::from_axis_angle(axis, 1.0).rotate(v));
    }

    #[test]
    fn test_conjugate_undoes_rotation() {
        let q = Quaternion::from_axis_angle(Vec3::new(0.3, -1.0, 0.2), PI / 3.0);
        let v = Vec3::new(0.5, 0.5, -1.5);
        assert_vec_eq(q.conjugate().rotate(q.rotate(v)), v);
    }

    #[test]
    fn test_zero_axis_is_identity() {
        assert_eq!(Quaternion::from_axis_angle(Vec3::ZERO, 1.0), Quaternion::identity());
        assert_eq!(Quaternion { w: 0.0, x: 0.0, y: 0.0, z: 0.0 }.normalize(), Quaternion::identity());
    }

    #[test]
    fn test_smoothstep_monotonic_with_fixed_ends() {
        assert_eq!(smoothstep(0.0), 0.0);
        assert_eq!(smoothstep(1.0), 1.0);
        assert_eq!(smoothstep(-3.0), 0.0);
        assert_eq!(smoothstep(7.0), 1.0);
        let mut prev = 0.0;
        for i in 1..=100 {
            let s = smoothstep(i as f32 / 100.0);
            assert!(s >= prev);
            prev = s;
        }
    }

    #[test]
    fn test_from_slice_needs_three_components() {
        assert_eq!(Vec3::from_slice(&[1.0, 2.0, 3.0]), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(Vec3::from_slice(&[1.0, 2.0]), None);
        assert_eq!(Vec3::from_slice(&[1.0, 2.0, 3.0, 4.0]), None);
    }

    #[test]
    fn test_vec_lerp_midpoint() {
        let a = Vec3::new(0.0, 2.0, -4.0);
        let b = Vec3::new(2.0, 0.0, 4.0);
        assert_vec_eq(a.lerp(b, 0.5), Vec3::new(1.0, 1.0, 0.0));
        assert_relative_eq!(lerp(1.0, 3.0, 0.25), 1.5);
    }
}
