//! Covariance-weighted ICP against an accumulated landmark model.
//!
//! Instead of the previous frame, each frame is registered against a
//! [`GaussianMixtureModel`] that averages landmark observations over a window
//! of recent frames. The model lives in the world frame, so the registration
//! result is the camera pose `T_wc` directly.

use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};

use super::correspondence::PointIndex;
use super::icp_model::{mahalanobis_correspondences, mahalanobis_icp, GaussianCloud};
use super::mixture::{GaussianMixtureModel, Observation};
use super::{EstimatorKind, FrameCloud, MotionEstimate, MotionEstimator, RegistrationError};
use crate::config::{IcpConfig, RegistrationConfig};
use crate::frame::RgbdFrame;
use crate::geometry::SE3;

pub struct IcpProbModel {
    config: IcpConfig,
    min_correspondences: usize,
    max_condition: f64,
    model: GaussianMixtureModel,
}

impl IcpProbModel {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            config: config.icp.clone(),
            min_correspondences: config.min_correspondences,
            max_condition: config.max_condition_number,
            model: GaussianMixtureModel::new(&config.model),
        }
    }

    pub fn model(&self) -> &GaussianMixtureModel {
        &self.model
    }
}

impl MotionEstimator for IcpProbModel {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::IcpProbModel
    }

    fn estimate_motion(
        &mut self,
        frame: &Arc<RgbdFrame>,
        prior: &SE3,
        prediction: &SE3,
    ) -> Result<MotionEstimate, RegistrationError> {
        if self.model.is_empty() {
            return Err(RegistrationError::NoReference);
        }

        let matchable = self.model.matchable();
        let components = self.model.components();
        let target_points: Vec<Vector3<f64>> = matchable.iter().map(|&i| components[i].mean).collect();
        let target_covs: Vec<Matrix3<f64>> =
            matchable.iter().map(|&i| components[i].covariance).collect();
        let index = PointIndex::new(&target_points);
        let target = GaussianCloud {
            points: &target_points,
            covariances: &target_covs,
        };

        let current = FrameCloud::from_frame(frame);
        let source = GaussianCloud {
            points: &current.points,
            covariances: &current.covariances,
        };

        let initial = prior * prediction;
        let outcome = mahalanobis_icp(
            source,
            target,
            &index,
            &initial,
            &self.config,
            self.min_correspondences,
            self.max_condition,
        )?;
        let pose = outcome.transform;

        let mut associations = vec![None; current.len()];
        for c in mahalanobis_correspondences(
            source,
            target,
            &index,
            &pose,
            self.config.max_correspondence_distance,
        ) {
            if c.distance <= self.config.max_mahalanobis_distance {
                associations[c.source] = Some(matchable[c.target]);
            }
        }
        self.model
            .update(Observation::from_frame(frame, &pose), &associations);

        tracing::trace!(components = self.model.len(), "Updated landmark model");

        Ok(MotionEstimate {
            relative: prior.inverse() * pose,
            stats: outcome.stats,
        })
    }

    fn observe(&mut self, frame: &Arc<RgbdFrame>, pose: &SE3) {
        self.model.integrate(
            Observation::from_frame(frame, pose),
            self.config.max_correspondence_distance,
            self.config.max_mahalanobis_distance,
        );
    }

    fn rebase(&mut self, correction: &SE3) {
        self.model.transform(correction);
    }

    fn reset(&mut self) {
        self.model.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SyntheticScene;

    #[test]
    fn test_first_frame_has_no_reference() {
        let scene = SyntheticScene::new(2);
        let frame = scene.render(&SE3::identity(), 0.0);
        let mut estimator = IcpProbModel::new(&RegistrationConfig::default());

        assert_eq!(
            estimator
                .estimate_motion(&frame, &SE3::identity(), &SE3::identity())
                .unwrap_err(),
            RegistrationError::NoReference
        );
        estimator.observe(&frame, &SE3::identity());
        assert_eq!(estimator.model().len(), frame.n_valid_keypoints());
    }

    #[test]
    fn test_tracks_sequence_and_refines_model() {
        let scene = SyntheticScene::new(31);
        let step = SE3::from_axis_angle(&Vector3::y(), 0.008, Vector3::new(0.015, 0.0, 0.01));
        let mut estimator = IcpProbModel::new(&RegistrationConfig::default());

        let mut truth = SE3::identity();
        let mut pose = SE3::identity();
        estimator.observe(&scene.render(&truth, 0.0), &pose);
        let initial_size = estimator.model().len();

        for i in 1..6 {
            truth = truth * step;
            let frame = scene.render(&truth, i as f64 * 0.1);
            let estimate = estimator
                .estimate_motion(&frame, &pose, &SE3::identity())
                .unwrap();
            pose = pose * estimate.relative;
        }

        assert!(pose.approx_eq(&truth, 1e-2, 1e-2));
        assert!(estimator.model().components().iter().any(|c| c.hits > 1));
        assert!(estimator.model().len() >= initial_size);
    }

    #[test]
    fn test_rebase_moves_model() {
        let scene = SyntheticScene::new(5);
        let mut estimator = IcpProbModel::new(&RegistrationConfig::default());
        estimator.observe(&scene.render(&SE3::identity(), 0.0), &SE3::identity());
        let before = estimator.model().components()[0].mean;

        let shift = SE3::from_translation(Vector3::new(0.5, 0.0, 0.0));
        estimator.rebase(&shift);
        let after = estimator.model().components()[0].mean;

        assert!((after - before - Vector3::new(0.5, 0.0, 0.0)).norm() < 1e-12);
    }
}
