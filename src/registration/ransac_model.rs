//! Descriptor RANSAC against the accumulated landmark model.
//!
//! Keypoint descriptors of the current frame are matched against the
//! descriptors carried by model components. Since the model lives in the world
//! frame, the consensus transform is the camera pose itself, and the inlier
//! matches become the associations used to refine the model.

use std::sync::Arc;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::correspondence::match_descriptors;
use super::mixture::{GaussianMixtureModel, Observation};
use super::ransac::ransac_rigid;
use super::{
    require_correspondences, EstimatorKind, MotionEstimate, MotionEstimator, RegistrationError,
    RegistrationStats,
};
use crate::config::{RansacConfig, RegistrationConfig};
use crate::frame::{Descriptor, RgbdFrame};
use crate::geometry::SE3;

pub struct RansacModel {
    config: RansacConfig,
    min_correspondences: usize,
    max_condition: f64,
    association_distance: f64,
    association_gate: f64,
    rng: StdRng,
    model: GaussianMixtureModel,
}

impl RansacModel {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            config: config.ransac.clone(),
            min_correspondences: config.min_correspondences,
            max_condition: config.max_condition_number,
            association_distance: config.icp.max_correspondence_distance,
            association_gate: config.icp.max_mahalanobis_distance,
            rng: StdRng::seed_from_u64(config.ransac.seed),
            model: GaussianMixtureModel::new(&config.model),
        }
    }

    pub fn model(&self) -> &GaussianMixtureModel {
        &self.model
    }
}

impl MotionEstimator for RansacModel {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::RansacModel
    }

    fn estimate_motion(
        &mut self,
        frame: &Arc<RgbdFrame>,
        prior: &SE3,
        _prediction: &SE3,
    ) -> Result<MotionEstimate, RegistrationError> {
        if self.model.is_empty() {
            return Err(RegistrationError::NoReference);
        }

        // Model side: matchable components that carry a descriptor.
        let components = self.model.components();
        let (model_ids, model_descriptors): (Vec<usize>, Vec<&Descriptor>) = self
            .model
            .matchable()
            .into_iter()
            .filter_map(|i| Some((i, components[i].descriptor.as_ref()?)))
            .unzip();

        // Frame side, indexed like `Observation::from_frame`.
        let valid: Vec<usize> = frame.valid_indices().collect();
        let (frame_slots, frame_descriptors): (Vec<usize>, Vec<&Descriptor>) = valid
            .iter()
            .enumerate()
            .filter_map(|(slot, &i)| Some((slot, frame.descriptors().get(i)?)))
            .unzip();

        let matches = match_descriptors(
            &frame_descriptors,
            &model_descriptors,
            self.config.match_ratio,
            self.config.max_descriptor_distance,
        );
        require_correspondences(matches.len(), self.min_correspondences)?;

        let source: Vec<Vector3<f64>> = matches
            .iter()
            .map(|m| frame.kp_means()[valid[frame_slots[m.source]]])
            .collect();
        let target: Vec<Vector3<f64>> = matches
            .iter()
            .map(|m| components[model_ids[m.target]].mean)
            .collect();

        let result = ransac_rigid(
            &source,
            &target,
            &self.config,
            self.min_correspondences,
            self.max_condition,
            &mut self.rng,
        )?;
        let pose = result.transform;

        let mut associations = vec![None; valid.len()];
        for &k in &result.inliers {
            let m = &matches[k];
            associations[frame_slots[m.source]] = Some(model_ids[m.target]);
        }
        self.model
            .update(Observation::from_frame(frame, &pose), &associations);

        Ok(MotionEstimate {
            relative: prior.inverse() * pose,
            stats: RegistrationStats {
                correspondences: matches.len(),
                inliers: result.inliers.len(),
                iterations: result.iterations,
                rmse: result.rmse,
            },
        })
    }

    fn observe(&mut self, frame: &Arc<RgbdFrame>, pose: &SE3) {
        self.model.integrate(
            Observation::from_frame(frame, pose),
            self.association_distance,
            self.association_gate,
        );
    }

    fn rebase(&mut self, correction: &SE3) {
        self.model.transform(correction);
    }

    fn reset(&mut self) {
        self.model.clear();
        self.rng = StdRng::seed_from_u64(self.config.seed);
    }
}
