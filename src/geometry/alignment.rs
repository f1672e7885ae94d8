//! Closed-form rigid alignment of corresponding 3D point sets.
//!
//! Weighted variant of Horn's absolute orientation solved via SVD:
//!
//! 1. Weighted centroids of both point sets
//! 2. Weighted cross-covariance `H = Σ wᵢ (pᵢ - p̄)(qᵢ - q̄)ᵀ`
//! 3. `R = V Uᵀ` from `H = U S Vᵀ`, with the reflection case fixed up
//! 4. `t = q̄ - R p̄`
//!
//! The source scatter matrix is inspected before solving: coincident or
//! collinear configurations leave the rotation about the line undetermined and
//! are reported as ill-conditioned instead of returning an arbitrary answer.

use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

use super::SE3;

/// Minimum number of correspondences for a rigid fit.
pub const MIN_ALIGNMENT_POINTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignmentError {
    #[error("need at least {MIN_ALIGNMENT_POINTS} correspondences, got {0}")]
    TooFewPoints(usize),

    #[error("point sets have different lengths ({source_len} vs {target_len})")]
    LengthMismatch { source_len: usize, target_len: usize },

    #[error("degenerate point configuration (condition number {condition:.3e})")]
    Degenerate { condition: f64 },

    #[error("svd failed")]
    Svd,
}

/// Weighted centroid; uniform weights when `weights` is `None`.
pub fn weighted_centroid(points: &[Vector3<f64>], weights: Option<&[f64]>) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    match weights {
        Some(w) => {
            let total: f64 = w.iter().sum();
            if total <= 0.0 {
                return Vector3::zeros();
            }
            points
                .iter()
                .zip(w)
                .fold(Vector3::zeros(), |acc, (p, wi)| acc + p * *wi)
                / total
        }
        None => points.iter().sum::<Vector3<f64>>() / points.len() as f64,
    }
}

/// Condition number of the (weighted) scatter of a point set, computed as the
/// ratio of the largest to the second largest eigenvalue.
///
/// Returns `f64::INFINITY` for coincident or collinear points.
pub fn scatter_condition(points: &[Vector3<f64>], weights: Option<&[f64]>) -> f64 {
    let centroid = weighted_centroid(points, weights);
    let mut scatter = Matrix3::zeros();
    for (i, p) in points.iter().enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        let d = p - centroid;
        scatter += w * d * d.transpose();
    }

    let mut eigenvalues: Vec<f64> = scatter.symmetric_eigenvalues().iter().copied().collect();
    eigenvalues.sort_by(|a, b| b.total_cmp(a));

    let largest = eigenvalues[0];
    let second = eigenvalues[1];
    if largest <= f64::EPSILON || second <= largest * f64::EPSILON {
        return f64::INFINITY;
    }
    largest / second
}

/// Compute the rigid transform `T` minimising `Σ wᵢ ‖T·sourceᵢ − targetᵢ‖²`.
///
/// # Arguments
/// * `source` - Points in the frame being aligned
/// * `target` - Corresponding points in the reference frame
/// * `weights` - Optional non-negative per-pair weights
/// * `max_condition` - Reject configurations whose scatter condition exceeds this
pub fn align_points(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    weights: Option<&[f64]>,
    max_condition: f64,
) -> Result<SE3, AlignmentError> {
    if source.len() != target.len() {
        return Err(AlignmentError::LengthMismatch {
            source_len: source.len(),
            target_len: target.len(),
        });
    }
    if source.len() < MIN_ALIGNMENT_POINTS {
        return Err(AlignmentError::TooFewPoints(source.len()));
    }

    let condition = scatter_condition(source, weights);
    if !condition.is_finite() || condition > max_condition {
        return Err(AlignmentError::Degenerate { condition });
    }

    let centroid_src = weighted_centroid(source, weights);
    let centroid_tgt = weighted_centroid(target, weights);

    let mut h = Matrix3::zeros();
    for (i, (p, q)) in source.iter().zip(target).enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        h += w * (p - centroid_src) * (q - centroid_tgt).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(AlignmentError::Svd)?;
    let v_t = svd.v_t.ok_or(AlignmentError::Svd)?;

    let mut rotation = v_t.transpose() * u.transpose();

    // Reflection: flip the axis of the smallest singular value.
    if rotation.determinant() < 0.0 {
        let mut v = v_t.transpose();
        let smallest = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(2);
        for r in 0..3 {
            v[(r, smallest)] = -v[(r, smallest)];
        }
        rotation = v * u.transpose();
    }

    let translation = centroid_tgt - rotation * centroid_src;
    Ok(SE3::from_rotation_matrix(&rotation, translation))
}

/// Root mean squared residual of `T·source` against `target`.
pub fn alignment_rmse(source: &[Vector3<f64>], target: &[Vector3<f64>], transform: &SE3) -> f64 {
    if source.is_empty() {
        return f64::INFINITY;
    }
    let sum_sq: f64 = source
        .iter()
        .zip(target)
        .map(|(p, q)| (transform.transform_point(p) - q).norm_squared())
        .sum();
    (sum_sq / source.len() as f64).sqrt()
}
