//! Gauss-Newton step for covariance-weighted point-to-point registration.
//!
//! For a pair `(p, q)` with covariances `Σp`, `Σq` and current transform `T`:
//!
//! ```text
//! r = T·p − q
//! W = (R Σp Rᵀ + Σq)⁻¹
//! J = [ −[T·p]×  I ]          (left perturbation, δ = [ω; v])
//! H = Σ ρ Jᵀ W J,  g = Σ ρ Jᵀ W r,  δ = −H⁻¹ g
//! ```
//!
//! `ρ` is a Huber weight on the Mahalanobis distance so far pairs lose
//! influence smoothly instead of being cut off.

use nalgebra::{Matrix3, Matrix3x6, Matrix6, Vector3, Vector6};

use super::RegistrationError;
use crate::geometry::{skew, SE3};

/// One weighted residual term.
#[derive(Debug, Clone, Copy)]
pub struct WeightedPair {
    pub source: Vector3<f64>,
    pub source_cov: Matrix3<f64>,
    pub target: Vector3<f64>,
    pub target_cov: Matrix3<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct GaussNewtonStep {
    pub delta: Vector6<f64>,
    /// Robustified Mahalanobis cost at the linearisation point.
    pub cost: f64,
    /// Pairs whose Mahalanobis distance was within the Huber gate.
    pub inliers: usize,
    pub condition: f64,
}

/// Added to combined covariances so exact (zero-variance) points stay invertible.
const COVARIANCE_FLOOR: f64 = 1e-12;

/// Huber weight for a Mahalanobis distance `d`.
#[inline]
pub fn huber_weight(d: f64, gate: f64) -> f64 {
    if d <= gate {
        1.0
    } else {
        gate / d
    }
}

/// Combined covariance of a pair under the current transform.
#[inline]
pub fn combined_covariance(transform: &SE3, source_cov: &Matrix3<f64>, target_cov: &Matrix3<f64>) -> Matrix3<f64> {
    transform.rotate_covariance(source_cov) + target_cov + Matrix3::identity() * COVARIANCE_FLOOR
}

/// Squared Mahalanobis distance of `residual` under `covariance`.
#[inline]
pub fn mahalanobis_sq(residual: &Vector3<f64>, covariance: &Matrix3<f64>) -> Option<f64> {
    let info = covariance.try_inverse()?;
    Some((residual.transpose() * info * residual)[(0, 0)])
}

/// Ratio of the largest to the smallest eigenvalue of a symmetric matrix.
pub fn condition_number(h: &Matrix6<f64>) -> f64 {
    let eigen = h.symmetric_eigenvalues();
    let max = eigen.max();
    let min = eigen.min();
    if min <= 0.0 {
        return f64::INFINITY;
    }
    max / min
}

/// Build and solve the normal equations at `transform`.
pub fn mahalanobis_step(
    pairs: &[WeightedPair],
    transform: &SE3,
    robust_gate: f64,
    max_condition: f64,
) -> Result<GaussNewtonStep, RegistrationError> {
    let mut h = Matrix6::<f64>::zeros();
    let mut g = Vector6::<f64>::zeros();
    let mut cost = 0.0;
    let mut inliers = 0;

    for pair in pairs {
        let p = transform.transform_point(&pair.source);
        let r = p - pair.target;
        let Some(w) = combined_covariance(transform, &pair.source_cov, &pair.target_cov).try_inverse()
        else {
            continue;
        };

        let d_sq = (r.transpose() * w * r)[(0, 0)].max(0.0);
        let d = d_sq.sqrt();
        let rho = huber_weight(d, robust_gate);
        if d <= robust_gate {
            inliers += 1;
        }

        let mut j = Matrix3x6::<f64>::zeros();
        j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(&p)));
        j.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());

        let jt_w = j.transpose() * w * rho;
        h += jt_w * j;
        g += jt_w * r;
        cost += rho * d_sq;
    }

    let condition = condition_number(&h);
    if !condition.is_finite() || condition > max_condition {
        return Err(RegistrationError::IllConditioned { condition });
    }

    let delta = match h.cholesky() {
        Some(chol) => -chol.solve(&g),
        None => -h
            .lu()
            .solve(&g)
            .ok_or(RegistrationError::IllConditioned { condition })?,
    };

    Ok(GaussNewtonStep {
        delta,
        cost,
        inliers,
        condition,
    })
}
