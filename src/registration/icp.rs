//! Point-to-point Iterative Closest Point.
//!
//! ```text
//! Input: source S, target T, initial guess X₀
//!
//! 1. For each iteration:
//!    a. Nearest target for each X·sᵢ within the correspondence radius
//!    b. Closed-form rigid fit of the matched pairs (SVD)
//!    c. Stop when the change between fits drops below tolerance
//! 2. Fail if the iteration cap is reached first
//! ```

use std::sync::Arc;

use nalgebra::Vector3;

use super::correspondence::{nearest_neighbors, PointIndex};
use super::{
    require_correspondences, EstimatorKind, FrameCloud, MotionEstimate, MotionEstimator,
    RegistrationError, RegistrationStats,
};
use crate::config::{IcpConfig, RegistrationConfig};
use crate::frame::RgbdFrame;
use crate::geometry::{align_points, alignment_rmse, SE3};

/// Result of an ICP alignment of `source` onto `target`.
#[derive(Debug, Clone, Copy)]
pub struct IcpOutcome {
    /// `T_target_source`.
    pub transform: SE3,
    pub stats: RegistrationStats,
}

/// True once an update is below both tolerances.
pub(crate) fn converged(previous: &SE3, next: &SE3, config: &IcpConfig) -> bool {
    let delta = previous.between(next);
    delta.translation_norm() < config.tolerance_translation
        && delta.rotation_angle() < config.tolerance_rotation
}

/// Align `source` onto the points behind `target_index`.
pub fn point_to_point_icp(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    target_index: &PointIndex,
    initial: &SE3,
    config: &IcpConfig,
    min_correspondences: usize,
    max_condition: f64,
) -> Result<IcpOutcome, RegistrationError> {
    let mut transform = *initial;

    for iteration in 1..=config.max_iterations {
        let pairs = nearest_neighbors(
            source,
            &transform,
            target_index,
            config.max_correspondence_distance,
        );
        require_correspondences(pairs.len(), min_correspondences)?;

        let src: Vec<_> = pairs.iter().map(|c| source[c.source]).collect();
        let tgt: Vec<_> = pairs.iter().map(|c| target[c.target]).collect();
        let next = align_points(&src, &tgt, None, max_condition)?;

        let done = converged(&transform, &next, config);
        transform = next;

        if done {
            return Ok(IcpOutcome {
                transform,
                stats: RegistrationStats {
                    correspondences: pairs.len(),
                    inliers: pairs.len(),
                    iterations: iteration,
                    rmse: alignment_rmse(&src, &tgt, &transform),
                },
            });
        }
    }

    Err(RegistrationError::NotConverged {
        iterations: config.max_iterations,
    })
}

/// Plain ICP against the previous frame's valid keypoints.
pub struct Icp {
    config: IcpConfig,
    min_correspondences: usize,
    max_condition: f64,
    reference: Option<(FrameCloud, PointIndex)>,
}

impl Icp {
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

impl MotionEstimator for Icp {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Icp
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
        let result = point_to_point_icp(
            &current.points,
            &reference.points,
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
