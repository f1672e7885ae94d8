//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Poses follow the `T_target_source` convention used across the crate: a
//! camera pose `T_wc` maps points from the camera frame into the world frame,
//! `p_world = pose.transform_point(&p_cam)`. Composition is left-to-right
//! matrix multiplication, so `T_wa * T_ab = T_wb`.

use std::fmt;
use std::ops::Mul;

use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3, Vector6};

use super::so3::{exp_so3, left_jacobian_so3};

/// Rigid body transformation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_parts(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a rotation matrix that is assumed orthonormal.
    pub fn from_rotation_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(*rotation);
        Self {
            rotation: normalized(UnitQuaternion::from_rotation_matrix(&rot3)),
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Rotation of `angle` radians around `axis`, followed by `translation`.
    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64, translation: Vector3<f64>) -> Self {
        let rotation = if axis.norm() > 0.0 {
            UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(*axis), angle)
        } else {
            UnitQuaternion::identity()
        };
        Self {
            rotation,
            translation,
        }
    }

    /// Exponential map from a twist `[ω; v]` (left perturbation convention).
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let omega = Vector3::new(xi[0], xi[1], xi[2]);
        let v = Vector3::new(xi[3], xi[4], xi[5]);
        Self {
            rotation: exp_so3(&omega),
            translation: left_jacobian_so3(&omega) * v,
        }
    }

    pub fn inverse(&self) -> Self {
        let rotation = normalized(self.rotation.inverse());
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self * other`.
    ///
    /// The rotation is renormalised on every product. `UnitQuaternion::inverse`
    /// is a plain conjugate, so norm drift compounds through `a⁻¹ · b · a`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: normalized(self.rotation * other.rotation),
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Relative transform from `self` to `other`: `self⁻¹ * other`.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotate a point covariance into the target frame: `R Σ Rᵀ`.
    #[inline]
    pub fn rotate_covariance(&self, cov: &Matrix3<f64>) -> Matrix3<f64> {
        let r = self.rotation_matrix();
        r * cov * r.transpose()
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Rotation angle in radians, in `[0, π]`.
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }

    pub fn translation_norm(&self) -> f64 {
        self.translation.norm()
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation)
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self {
            rotation: iso.rotation,
            translation: iso.translation.vector,
        }
    }

    /// True when both transforms agree within the given tolerances.
    pub fn approx_eq(&self, other: &SE3, translation_tol: f64, rotation_tol: f64) -> bool {
        let delta = self.between(other);
        delta.translation_norm() <= translation_tol && delta.rotation_angle() <= rotation_tol
    }
}

/// Project a quaternion carrying rounding drift back onto the unit sphere.
#[inline]
fn normalized(q: UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::new_normalize(q.into_inner())
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

impl<'a> Mul<&'a SE3> for &'a SE3 {
    type Output = SE3;

    fn mul(self, rhs: &'a SE3) -> SE3 {
        self.compose(rhs)
    }
}

impl fmt::Display for SE3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.rotation.euler_angles();
        write!(
            f,
            "[t=({:.3}, {:.3}, {:.3}) rpy=({:.2}°, {:.2}°, {:.2}°)]",
            self.translation.x,
            self.translation.y,
            self.translation.z,
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        )
    }
}
