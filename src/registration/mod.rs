//! Motion estimation between RGB-D frames.
//!
//! Every strategy implements [`MotionEstimator`] and returns the relative
//! motion `T_prev_curr` of the camera, which maps points from the current
//! camera frame into the previous one. Failures are values
//! ([`RegistrationError`]); the caller decides how to fall back.
//!
//! Frame-to-frame strategies ([`Icp`], [`IcpModel`], [`Ransac`],
//! [`ParticleFilterRegistration`]) register against the previously observed
//! frame. Model strategies ([`IcpProbModel`], [`RansacModel`]) register
//! against a [`GaussianMixtureModel`] of landmarks kept in the world frame.

pub mod bank;
pub mod correspondence;
pub mod gauss_newton;
pub mod icp;
pub mod icp_model;
pub mod icp_prob_model;
pub mod mixture;
pub mod particles;
pub mod ransac;
pub mod ransac_model;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::RgbdFrame;
use crate::geometry::{AlignmentError, SE3, MIN_ALIGNMENT_POINTS};

pub use bank::EstimatorBank;
pub use correspondence::{match_descriptors, nearest_neighbors, Correspondence, PointIndex};
pub use icp::Icp;
pub use icp_model::IcpModel;
pub use icp_prob_model::IcpProbModel;
pub use mixture::{Component, GaussianMixtureModel};
pub use particles::{ParticleAlignment, ParticleFilterRegistration};
pub use ransac::Ransac;
pub use ransac_model::RansacModel;

/// Selectable registration strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Point-to-point ICP against the previous frame.
    Icp,
    /// Covariance-weighted ICP against the previous frame.
    IcpModel,
    /// Covariance-weighted ICP against the accumulated landmark model.
    #[default]
    IcpProbModel,
    /// Descriptor matching + RANSAC against the previous frame.
    Ransac,
    /// Descriptor matching + RANSAC against the accumulated landmark model.
    RansacModel,
    /// Particle filter over pose hypotheses against the previous frame.
    ParticleFilter,
}

impl EstimatorKind {
    pub const ALL: [EstimatorKind; 6] = [
        EstimatorKind::Icp,
        EstimatorKind::IcpModel,
        EstimatorKind::IcpProbModel,
        EstimatorKind::Ransac,
        EstimatorKind::RansacModel,
        EstimatorKind::ParticleFilter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EstimatorKind::Icp => "icp",
            EstimatorKind::IcpModel => "icp_model",
            EstimatorKind::IcpProbModel => "icp_prob_model",
            EstimatorKind::Ransac => "ransac",
            EstimatorKind::RansacModel => "ransac_model",
            EstimatorKind::ParticleFilter => "particle_filter",
        }
    }

    /// Model strategies keep world-frame state that survives tracking gaps.
    pub fn uses_model(&self) -> bool {
        matches!(self, EstimatorKind::IcpProbModel | EstimatorKind::RansacModel)
    }
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    #[error("only {found} correspondences, need {required}")]
    TooFewCorrespondences { found: usize, required: usize },

    #[error("ill-conditioned solve (condition number {condition:.3e})")]
    IllConditioned { condition: f64 },

    #[error("did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("no reference to register against")]
    NoReference,

    #[error("no consensus among correspondences")]
    NoConsensus,

    #[error("inlier ratio {inlier_ratio:.2} below {required:.2}")]
    LowConfidence { inlier_ratio: f64, required: f64 },

    #[error("aborted")]
    Aborted,
}

impl From<AlignmentError> for RegistrationError {
    fn from(err: AlignmentError) -> Self {
        match err {
            AlignmentError::TooFewPoints(found) => RegistrationError::TooFewCorrespondences {
                found,
                required: MIN_ALIGNMENT_POINTS,
            },
            AlignmentError::LengthMismatch {
                source_len,
                target_len,
            } => RegistrationError::TooFewCorrespondences {
                found: source_len.min(target_len),
                required: MIN_ALIGNMENT_POINTS,
            },
            AlignmentError::Degenerate { condition } => {
                RegistrationError::IllConditioned { condition }
            }
            AlignmentError::Svd => RegistrationError::IllConditioned {
                condition: f64::INFINITY,
            },
        }
    }
}

/// Diagnostics of a registration run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegistrationStats {
    /// Correspondences found in the final iteration.
    pub correspondences: usize,
    /// Correspondences accepted as inliers.
    pub inliers: usize,
    pub iterations: usize,
    /// Root mean squared Euclidean residual over inliers (metres).
    pub rmse: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionEstimate {
    /// `T_prev_curr`.
    pub relative: SE3,
    pub stats: RegistrationStats,
}

/// A registration strategy.
///
/// `prior` is the world pose of the previously processed frame and
/// `prediction` the predicted relative motion used as the initial guess.
pub trait MotionEstimator: Send {
    fn kind(&self) -> EstimatorKind;

    fn estimate_motion(
        &mut self,
        frame: &Arc<RgbdFrame>,
        prior: &SE3,
        prediction: &SE3,
    ) -> Result<MotionEstimate, RegistrationError>;

    /// Take `frame` at the known world `pose` as the reference without
    /// registering it.
    fn observe(&mut self, frame: &Arc<RgbdFrame>, pose: &SE3);

    /// Apply a world-frame correction `T_new_old` to any world-frame state.
    fn rebase(&mut self, _correction: &SE3) {}

    fn reset(&mut self);
}

/// Ensure a correspondence count satisfies the configured minimum.
pub(crate) fn require_correspondences(found: usize, required: usize) -> Result<(), RegistrationError> {
    if found < required {
        return Err(RegistrationError::TooFewCorrespondences { found, required });
    }
    Ok(())
}

/// Means and covariances of the valid keypoints of a frame.
#[derive(Debug, Clone, Default)]
pub(crate) struct FrameCloud {
    pub points: Vec<nalgebra::Vector3<f64>>,
    pub covariances: Vec<nalgebra::Matrix3<f64>>,
}

impl FrameCloud {
    pub fn from_frame(frame: &RgbdFrame) -> Self {
        let (points, covariances) = frame
            .valid_indices()
            .map(|i| (frame.kp_means()[i], frame.kp_covariances()[i]))
            .unzip();
        Self {
            points,
            covariances,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}
