//! 3D primitives for operation payloads.
//!
//! `Point3D` and `Transform3D` carry the geometric intent of an operation;
//! `Quaternion` exists so that concurrent rotations can be composed instead
//! of averaged (Euler averaging is not rotation-order-invariant and produces
//! gimbal-lock artifacts near ±90° pitch).
//!
//! No physical plausibility checks happen here — that is the geometry
//! engine's job. These types only do arithmetic.

use serde::{Deserialize, Serialize};

/// 3D position or direction in model (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3D {
    pub const ZERO: Point3D = Point3D { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn add(&self, other: &Point3D) -> Point3D {
        Point3D {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }

    pub fn sub(&self, other: &Point3D) -> Point3D {
        Point3D {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }

    pub fn scale(&self, factor: f64) -> Point3D {
        Point3D {
            x: self.x * factor,
            y: self.y * factor,
            z: self.z * factor,
        }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point3D) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Linear interpolation toward `target` by factor `t` ∈ [0, 1].
    pub fn lerp(&self, target: &Point3D, t: f64) -> Point3D {
        Point3D {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
            z: self.z + (target.z - self.z) * t,
        }
    }

    /// Component-wise midpoint of two points.
    pub fn midpoint(&self, other: &Point3D) -> Point3D {
        self.lerp(other, 0.5)
    }

    /// Approximate equality within `epsilon` on every component.
    pub fn approx_eq(&self, other: &Point3D, epsilon: f64) -> bool {
        (self.x - other.x).abs() < epsilon
            && (self.y - other.y).abs() < epsilon
            && (self.z - other.z).abs() < epsilon
    }
}

impl Default for Point3D {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Rotation expressed as intrinsic x/y/z Euler angles, in degrees.
///
/// Degrees on the wire because that is what clients send; conversion to
/// radians happens only inside the quaternion math.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EulerAngles {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl EulerAngles {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn approx_eq(&self, other: &EulerAngles, epsilon: f64) -> bool {
        (self.x - other.x).abs() < epsilon
            && (self.y - other.y).abs() < epsilon
            && (self.z - other.z).abs() < epsilon
    }
}

/// Unit quaternion for rotation composition.
///
/// `compose(a, b)` means "apply rotation a, then rotation b" — the Hamilton
/// product `b ⊗ a`. Composition is non-commutative; tests rely on that.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    /// Build from Euler angles (degrees, roll/pitch/yaw about x/y/z).
    pub fn from_euler(angles: &EulerAngles) -> Self {
        let (rx, ry, rz) = (
            angles.x.to_radians() * 0.5,
            angles.y.to_radians() * 0.5,
            angles.z.to_radians() * 0.5,
        );
        let (sr, cr) = rx.sin_cos();
        let (sp, cp) = ry.sin_cos();
        let (sy, cy) = rz.sin_cos();

        Self {
            w: cr * cp * cy + sr * sp * sy,
            x: sr * cp * cy - cr * sp * sy,
            y: cr * sp * cy + sr * cp * sy,
            z: cr * cp * sy - sr * sp * cy,
        }
    }

    /// Decompose back to Euler angles (degrees).
    ///
    /// Pitch is clamped to ±90° at the asin singularity.
    pub fn to_euler(&self) -> EulerAngles {
        let sinr_cosp = 2.0 * (self.w * self.x + self.y * self.z);
        let cosr_cosp = 1.0 - 2.0 * (self.x * self.x + self.y * self.y);
        let roll = sinr_cosp.atan2(cosr_cosp);

        let sinp = 2.0 * (self.w * self.y - self.z * self.x);
        let pitch = if sinp.abs() >= 1.0 {
            std::f64::consts::FRAC_PI_2.copysign(sinp)
        } else {
            sinp.asin()
        };

        let siny_cosp = 2.0 * (self.w * self.z + self.x * self.y);
        let cosy_cosp = 1.0 - 2.0 * (self.y * self.y + self.z * self.z);
        let yaw = siny_cosp.atan2(cosy_cosp);

        EulerAngles {
            x: roll.to_degrees(),
            y: pitch.to_degrees(),
            z: yaw.to_degrees(),
        }
    }

    /// Hamilton product `self ⊗ other`.
    pub fn multiply(&self, other: &Quaternion) -> Quaternion {
        Quaternion {
            w: self.w * other.w - self.x * other.x - self.y * other.y - self.z * other.z,
            x: self.w * other.x + self.x * other.w + self.y * other.z - self.z * other.y,
            y: self.w * other.y - self.x * other.z + self.y * other.w + self.z * other.x,
            z: self.w * other.z + self.x * other.y - self.y * other.x + self.z * other.w,
        }
    }

    /// Composition in application order: apply `first`, then `second`.
    pub fn compose(first: &Quaternion, second: &Quaternion) -> Quaternion {
        second.multiply(first)
    }

    pub fn length(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Normalize to a unit quaternion. Degenerate input yields identity.
    pub fn normalize(&self) -> Quaternion {
        let len = self.length();
        if len < 1e-12 {
            return Self::IDENTITY;
        }
        Quaternion {
            w: self.w / len,
            x: self.x / len,
            y: self.y / len,
            z: self.z / len,
        }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Affine transform carried by positional operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform3D {
    pub translation: Point3D,
    pub rotation: EulerAngles,
    pub scale: Point3D,
}

impl Transform3D {
    pub fn identity() -> Self {
        Self {
            translation: Point3D::ZERO,
            rotation: EulerAngles::default(),
            scale: Point3D::new(1.0, 1.0, 1.0),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.translation.approx_eq(&Point3D::ZERO, 1e-12)
            && self.rotation.approx_eq(&EulerAngles::default(), 1e-12)
            && self.scale.approx_eq(&Point3D::new(1.0, 1.0, 1.0), 1e-12)
    }

    /// Sequential composition: apply `self`, then `next`.
    ///
    /// Translations add, rotations compose through quaternions, scales
    /// multiply component-wise. This is the pairwise rule the merge path
    /// uses; it does not attempt a full matrix decomposition.
    pub fn then(&self, next: &Transform3D) -> Transform3D {
        let q = Quaternion::compose(
            &Quaternion::from_euler(&self.rotation),
            &Quaternion::from_euler(&next.rotation),
        );
        Transform3D {
            translation: self.translation.add(&next.translation),
            rotation: q.normalize().to_euler(),
            scale: Point3D::new(
                self.scale.x * next.scale.x,
                self.scale.y * next.scale.y,
                self.scale.z * next.scale.z,
            ),
        }
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Point3D tests ────────────────────────────────────────────

    #[test]
    fn test_point_new() {
        let p = Point3D::new(1.0, 2.0, 3.0);
        assert_eq!(p.x, 1.0);
        assert_eq!(p.y, 2.0);
        assert_eq!(p.z, 3.0);
    }

    #[test]
    fn test_point_distance() {
        let a = Point3D::new(0.0, 0.0, 0.0);
        let b = Point3D::new(2.0, 3.0, 6.0);
        assert!((a.distance(&b) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_point_add_sub() {
        let a = Point3D::new(1.0, 2.0, 3.0);
        let b = Point3D::new(4.0, 5.0, 6.0);
        let sum = a.add(&b);
        assert_eq!(sum, Point3D::new(5.0, 7.0, 9.0));
        assert_eq!(sum.sub(&b), a);
    }

    #[test]
    fn test_point_midpoint() {
        let a = Point3D::new(0.0, 0.0, 0.0);
        let b = Point3D::new(10.0, 20.0, -4.0);
        let mid = a.midpoint(&b);
        assert!(mid.approx_eq(&Point3D::new(5.0, 10.0, -2.0), 1e-9));
    }

    #[test]
    fn test_point_lerp_endpoints() {
        let a = Point3D::new(1.0, 1.0, 1.0);
        let b = Point3D::new(2.0, 4.0, 8.0);
        assert!(a.lerp(&b, 0.0).approx_eq(&a, 1e-12));
        assert!(a.lerp(&b, 1.0).approx_eq(&b, 1e-12));
    }

    // ── Quaternion tests ─────────────────────────────────────────

    #[test]
    fn test_quaternion_identity_roundtrip() {
        let euler = Quaternion::IDENTITY.to_euler();
        assert!(euler.approx_eq(&EulerAngles::default(), 1e-9));
    }

    #[test]
    fn test_quaternion_euler_roundtrip() {
        let angles = EulerAngles::new(10.0, 20.0, 30.0);
        let q = Quaternion::from_euler(&angles);
        let back = q.to_euler();
        assert!(back.approx_eq(&angles, 1e-6), "roundtrip drifted: {back:?}");
    }

    #[test]
    fn test_quaternion_unit_length() {
        let q = Quaternion::from_euler(&EulerAngles::new(45.0, -30.0, 120.0));
        assert!((q.length() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_quaternion_composition_not_naive_average() {
        // Composing 10° about x with 20° about y must NOT equal the
        // component-wise Euler average [5, 10, 0].
        let a = Quaternion::from_euler(&EulerAngles::new(10.0, 0.0, 0.0));
        let b = Quaternion::from_euler(&EulerAngles::new(0.0, 20.0, 0.0));
        let composed = Quaternion::compose(&a, &b).to_euler();

        let naive = EulerAngles::new(5.0, 10.0, 0.0);
        assert!(!composed.approx_eq(&naive, 0.5), "composition collapsed to a naive average");
        // The y component survives composition almost exactly.
        assert!((composed.y - 20.0).abs() < 1.0);
    }

    #[test]
    fn test_quaternion_composition_order_matters() {
        let a = Quaternion::from_euler(&EulerAngles::new(90.0, 0.0, 0.0));
        let b = Quaternion::from_euler(&EulerAngles::new(0.0, 90.0, 0.0));
        let ab = Quaternion::compose(&a, &b).to_euler();
        let ba = Quaternion::compose(&b, &a).to_euler();
        assert!(!ab.approx_eq(&ba, 1.0));
    }

    #[test]
    fn test_quaternion_normalize_degenerate() {
        let zero = Quaternion { w: 0.0, x: 0.0, y: 0.0, z: 0.0 };
        assert_eq!(zero.normalize(), Quaternion::IDENTITY);
    }

    // ── Transform3D tests ────────────────────────────────────────

    #[test]
    fn test_transform_identity() {
        let t = Transform3D::identity();
        assert!(t.is_identity());
    }

    #[test]
    fn test_transform_then_translations_add() {
        let mut a = Transform3D::identity();
        a.translation = Point3D::new(1.0, 0.0, 0.0);
        let mut b = Transform3D::identity();
        b.translation = Point3D::new(0.0, 2.0, 0.0);

        let c = a.then(&b);
        assert!(c.translation.approx_eq(&Point3D::new(1.0, 2.0, 0.0), 1e-12));
        assert!(c.scale.approx_eq(&Point3D::new(1.0, 1.0, 1.0), 1e-12));
    }

    #[test]
    fn test_transform_then_scales_multiply() {
        let mut a = Transform3D::identity();
        a.scale = Point3D::new(2.0, 2.0, 2.0);
        let mut b = Transform3D::identity();
        b.scale = Point3D::new(0.5, 3.0, 1.0);

        let c = a.then(&b);
        assert!(c.scale.approx_eq(&Point3D::new(1.0, 6.0, 2.0), 1e-12));
    }
}
