//! SO(3) helpers used by the SE3 exponential map and the registration
//! linearisation.
//!
//! The SE3 increment convention is a left perturbation `T' = exp(δ) · T` with
//! `δ = [ω; v]` (rotation first, then translation).

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map from a rotation vector to a unit quaternion.
pub fn exp_so3(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega)
}

/// Left Jacobian of SO(3), the `V` matrix of the SE3 exponential map.
///
/// ```text
/// V(ω) = I + (1 - cos θ)/θ² [ω]× + (θ - sin θ)/θ³ [ω]×²
/// ```
///
/// For small angles `V(ω) ≈ I + 0.5 [ω]×`.
pub fn left_jacobian_so3(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let skew_omega = skew(omega);

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * skew_omega;
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;

    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * skew_omega
        + ((theta - theta.sin()) / theta_cu) * skew_omega * skew_omega
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(skew(&v) * u, v.cross(&u), epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let s = skew(&Vector3::new(0.3, -1.2, 2.5));
        assert_relative_eq!(s, -s.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_so3_matches_axis_angle() {
        let omega = Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let q = exp_so3(&omega);
        let rotated = q * Vector3::new(1.0, 0.0, 0.0);

        assert_relative_eq!(rotated, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_left_jacobian_identity_at_zero() {
        let v = left_jacobian_so3(&Vector3::zeros());
        assert_relative_eq!(v, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_left_jacobian_small_angle_consistency() {
        // Just above and below the threshold must agree to first order.
        let below = left_jacobian_so3(&Vector3::new(5e-7, 0.0, 0.0));
        let above = left_jacobian_so3(&Vector3::new(2e-6, 0.0, 0.0));
        assert_relative_eq!(below, above, epsilon = 1e-5);
    }
}
