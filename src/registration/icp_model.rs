//! Covariance-weighted ICP.
//!
//! Correspondences are chosen among the k nearest Euclidean neighbours by
//! smallest Mahalanobis distance under the combined covariance of both
//! points, and the transform is refined by Gauss-Newton on the Mahalanobis
//! residuals. Near points with confident depth therefore pull harder than
//! far, noisy ones.

use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

use super::correspondence::{Correspondence, PointIndex};
use super::gauss_newton::{combined_covariance, mahalanobis_sq, mahalanobis_step, WeightedPair};
use super::icp::{converged, IcpOutcome};
use super::{
    require_correspondences, EstimatorKind, FrameCloud, MotionEstimate, MotionEstimator,
    RegistrationError, RegistrationStats,
};
use crate::config::{IcpConfig, RegistrationConfig};
use crate::frame::RgbdFrame;
use crate::geometry::SE3;

/// Euclidean candidates examined per source point.
const CANDIDATES: usize = 5;

/// Point means with their covariances.
#[derive(Debug, Clone, Copy)]
pub struct GaussianCloud<'a> {
    pub points: &'a [Vector3<f64>],
    pub covariances: &'a [Matrix3<f64>],
}

/// Best Mahalanobis match for each source point. `distance` is the Mahalanobis distance.
pub fn mahalanobis_correspondences(
    source: GaussianCloud<'_>,
    target: GaussianCloud<'_>,
    target_index: &PointIndex,
    transform: &SE3,
    max_distance: f64,
) -> Vec<Correspondence> {
    source
        .points
        .par_iter()
        .zip(source.covariances.par_iter())
        .enumerate()
        .filter_map(|(i, (p, cov))| {
            let q = transform.transform_point(p);
            target_index
                .nearest_n(&q, CANDIDATES)
                .into_iter()
                .filter(|&(_, d)| d <= max_distance)
                .filter_map(|(j, _)| {
                    let combined = combined_covariance(transform, cov, &target.covariances[j]);
                    let d_sq = mahalanobis_sq(&(q - target.points[j]), &combined)?;
                    Some(Correspondence {
                        source: i,
                        target: j,
                        distance: d_sq.max(0.0).sqrt(),
                    })
                })
                .min_by(|a, b| a.distance.total_cmp(&b.distance))
        })
        .collect()
}

/// Align a Gaussian `source` cloud onto a Gaussian `target` cloud.
pub fn mahalanobis_icp(
    source: GaussianCloud<'_>,
    target: GaussianCloud<'_>,
    target_index: &PointIndex,
    initial: &SE3,
    config: &IcpConfig,
    min_correspondences: usize,
    max_condition: f64,
) -> Result<IcpOutcome, RegistrationError> {
    let mut transform = *initial;

    for iteration in 1..=config.max_iterations {
        let matches = mahalanobis_correspondences(
            source,
            target,
            target_index,
            &transform,
            config.max_correspondence_distance,
        );
        require_correspondences(matches.len(), min_correspondences)?;

        let pairs: Vec<WeightedPair> = matches
            .iter()
            .map(|c| WeightedPair {
                source: source.points[c.source],
                source_cov: source.covariances[c.source],
                target: target.points[c.target],
                target_cov: target.covariances[c.target],
            })
            .collect();

        let step = mahalanobis_step(
            &pairs,
            &transform,
            config.max_mahalanobis_distance,
            max_condition,
        )?;
        let next = SE3::exp(&step.delta) * transform;
        let done = converged(&transform, &next, config);
        transform = next;

        if done {
            let sum_sq: f64 = pairs
                .iter()
                .map(|p| (transform.transform_point(&p.source) - p.target).norm_squared())
                .sum();
            return Ok(IcpOutcome {
                transform,
                stats: RegistrationStats {
                    correspondences: pairs.len(),
                    inliers: step.inliers,
                    iterations: iteration,
                    rmse: (sum_sq / pairs.len() as f64).sqrt(),
                },
            });
        }
    }

    Err(RegistrationError::NotConverged {
        iterations: config.max_iterations,
    })
}

/// Covariance-weighted ICP against the previous frame.
pub struct IcpModel {
    config: IcpConfig,
    min_correspondences: usize,
    max_condition: f64,
    reference: Option<(FrameCloud, PointIndex)>,
}

impl IcpModel {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            config: config.icp.clone(),
            min_correspondences: config.min_correspondences,
            max_condition: config.max_condition_number,
            reference: None,
        }
    }

    fn set_reference(&mut self, frame: &RgbdFrame) {
        let cloud = FrameCloud::from_frame(frame);
        let index = PointIndex::new(&cloud.points);
        self.reference = Some((cloud, index));
    }
}

impl MotionEstimator for IcpModel {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::IcpModel
    }

    fn estimate_motion(
        &mut self,
        frame: &Arc<RgbdFrame>,
        _prior: &SE3,
        prediction: &SE3,
    ) -> Result<MotionEstimate, RegistrationError> {
        let Some((reference, index)) = &self.reference else {
            return Err(RegistrationError::NoReference);
        };

        let current = FrameCloud::from_frame(frame);
        let result = mahalanobis_icp(
            GaussianCloud {
                points: &current.points,
                covariances: &current.covariances,
            },
            GaussianCloud {
                points: &reference.points,
                covariances: &reference.covariances,
            },
            index,
            prediction,
            &self.config,
            self.min_correspondences,
            self.max_condition,
        );

        self.set_reference(frame);
        let outcome = result?;
        Ok(MotionEstimate {
            relative: outcome.transform,
            stats: outcome.stats,
        })
    }

    fn observe(&mut self, frame: &Arc<RgbdFrame>, _pose: &SE3) {
        self.set_reference(frame);
    }

    fn reset(&mut self) {
        self.reference = None;
    }
}
