//! Persistent Gaussian mixture of 3D landmarks in the world frame.
//!
//! Matched observations refine their component with a Kalman update:
//!
//! ```text
//! K = Σm (Σm + Σz)⁻¹
//! μ ← μ + K (z − μ)
//! Σ ← (I − K) Σm
//! ```
//!
//! Unmatched observations become new components. Components not observed
//! for `max_age` frames are dropped, and the oldest go first once the model
//! exceeds `max_size`.

use nalgebra::{Matrix3, Vector3};

use super::correspondence::PointIndex;
use super::gauss_newton::{combined_covariance, mahalanobis_sq};
use crate::config::ModelConfig;
use crate::frame::{Descriptor, RgbdFrame};
use crate::geometry::SE3;

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub mean: Vector3<f64>,
    pub covariance: Matrix3<f64>,
    /// Descriptor of the latest matched observation.
    pub descriptor: Option<Descriptor>,
    pub hits: u32,
    /// Model frame counter at the last observation.
    pub last_seen: u64,
}

/// A world-frame keypoint observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub mean: Vector3<f64>,
    pub covariance: Matrix3<f64>,
    pub descriptor: Option<Descriptor>,
}

impl Observation {
    /// Valid keypoints of `frame` mapped into the world by `pose`.
    pub fn from_frame(frame: &RgbdFrame, pose: &SE3) -> Vec<Observation> {
        frame
            .valid_indices()
            .map(|i| Observation {
                mean: pose.transform_point(&frame.kp_means()[i]),
                covariance: pose.rotate_covariance(&frame.kp_covariances()[i]),
                descriptor: frame.descriptors().get(i).cloned(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct GaussianMixtureModel {
    config: ModelConfig,
    components: Vec<Component>,
    frame: u64,
}

impl GaussianMixtureModel {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            config: config.clone(),
            components: Vec::new(),
            frame: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Number of updates applied so far.
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    /// Indices of components observed often enough to be matched against.
    pub fn matchable(&self) -> Vec<usize> {
        self.components
            .iter()
            .enumerate()
            .filter_map(|(i, c)| (c.hits >= self.config.min_hits).then_some(i))
            .collect()
    }

    /// Fuse `observations` into the model.
    ///
    /// `associations[i]` names the component observation `i` was matched to,
    /// or `None` to add it as a new component.
    pub fn update(&mut self, observations: Vec<Observation>, associations: &[Option<usize>]) {
        self.frame += 1;
        let frame = self.frame;

        for (obs, assoc) in observations.into_iter().zip(associations) {
            match assoc.and_then(|j| self.components.get_mut(j)) {
                Some(component) => fuse(component, obs, frame),
                None => self.components.push(Component {
                    mean: obs.mean,
                    covariance: obs.covariance,
                    descriptor: obs.descriptor,
                    hits: 1,
                    last_seen: frame,
                }),
            }
        }

        self.prune();
    }

    /// Associate each observation with its Mahalanobis-nearest component
    /// (within `max_distance` metres and `gate` Mahalanobis units), then fuse.
    pub fn integrate(&mut self, observations: Vec<Observation>, max_distance: f64, gate: f64) {
        let associations = self.associate(&observations, max_distance, gate);
        self.update(observations, &associations);
    }

    pub fn associate(
        &self,
        observations: &[Observation],
        max_distance: f64,
        gate: f64,
    ) -> Vec<Option<usize>> {
        let means: Vec<_> = self.components.iter().map(|c| c.mean).collect();
        let index = PointIndex::new(&means);
        let identity = SE3::identity();

        observations
            .iter()
            .map(|obs| {
                index
                    .nearest_n(&obs.mean, 3)
                    .into_iter()
                    .filter(|&(_, d)| d <= max_distance)
                    .filter_map(|(j, _)| {
                        let c = &self.components[j];
                        let cov = combined_covariance(&identity, &obs.covariance, &c.covariance);
                        let d = mahalanobis_sq(&(obs.mean - c.mean), &cov)?.max(0.0).sqrt();
                        (d <= gate).then_some((j, d))
                    })
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(j, _)| j)
            })
            .collect()
    }

    /// Re-express the model after a world-frame correction `T_new_old`.
    pub fn transform(&mut self, correction: &SE3) {
        for c in &mut self.components {
            c.mean = correction.transform_point(&c.mean);
            c.covariance = correction.rotate_covariance(&c.covariance);
        }
    }

    pub fn clear(&mut self) {
        self.components.clear();
        self.frame = 0;
    }

    fn prune(&mut self) {
        let frame = self.frame;
        let max_age = self.config.max_age;
        self.components
            .retain(|c| frame.saturating_sub(c.last_seen) <= max_age);

        if self.components.len() > self.config.max_size {
            self.components
                .sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
            self.components.truncate(self.config.max_size);
        }
    }
}

fn fuse(component: &mut Component, obs: Observation, frame: u64) {
    component.hits = component.hits.saturating_add(1);
    component.last_seen = frame;
    if obs.descriptor.is_some() {
        component.descriptor = obs.descriptor;
    }

    let Some(innovation_inv) = (component.covariance + obs.covariance).try_inverse() else {
        return;
    };
    let gain = component.covariance * innovation_inv;
    component.mean += gain * (obs.mean - component.mean);
    let updated = (Matrix3::identity() - gain) * component.covariance;
    component.covariance = (updated + updated.transpose()) * 0.5;
}
