//! Descriptor-driven RANSAC registration.
//!
//! Correspondences come from descriptor matching rather than geometric
//! proximity, so no initial guess is needed. Minimal 3-point samples are fit
//! in closed form, scored by Euclidean inlier count, and the best hypothesis is
//! refined on its inlier set. The iteration budget adapts to the best inlier
//! ratio seen so far.

use std::sync::Arc;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::correspondence::match_descriptors;
use super::{
    require_correspondences, EstimatorKind, MotionEstimate, MotionEstimator, RegistrationError,
    RegistrationStats,
};
use crate::config::{RansacConfig, RegistrationConfig};
use crate::frame::{Descriptor, RgbdFrame};
use crate::geometry::{align_points, SE3, MIN_ALIGNMENT_POINTS};

/// Minimal samples whose own scatter is this ill-conditioned are skipped.
const SAMPLE_MAX_CONDITION: f64 = 1e6;

#[derive(Debug, Clone)]
pub struct RansacResult {
    /// `T_target_source`.
    pub transform: SE3,
    /// Indices of inlier pairs.
    pub inliers: Vec<usize>,
    pub iterations: usize,
    pub rmse: f64,
}

/// Number of iterations needed to draw an all-inlier sample with `probability`.
pub fn adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    // k = log(1 - p) / log(1 - wⁿ)
    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();
    if log_denom.abs() < 1e-10 {
        return 1;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}

fn find_inliers(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    transform: &SE3,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let threshold_sq = threshold * threshold;
    let mut inliers = Vec::new();
    let mut sum_sq = 0.0;
    for (i, (p, q)) in source.iter().zip(target).enumerate() {
        let err_sq = (transform.transform_point(p) - q).norm_squared();
        if err_sq <= threshold_sq {
            inliers.push(i);
            sum_sq += err_sq;
        }
    }
    let rmse = if inliers.is_empty() {
        f64::INFINITY
    } else {
        (sum_sq / inliers.len() as f64).sqrt()
    };
    (inliers, rmse)
}

/// Robustly fit `T` with `T·sourceᵢ ≈ targetᵢ` over putative pairs.
pub fn ransac_rigid(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    config: &RansacConfig,
    min_inliers: usize,
    max_condition: f64,
    rng: &mut StdRng,
) -> Result<RansacResult, RegistrationError> {
    let n = source.len();
    require_correspondences(n, min_inliers.max(MIN_ALIGNMENT_POINTS))?;

    let mut best: Option<RansacResult> = None;
    let mut max_iter = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iter {
        iteration += 1;
        let sample = rand::seq::index::sample(rng, n, MIN_ALIGNMENT_POINTS);
        let src: Vec<_> = sample.iter().map(|i| source[i]).collect();
        let tgt: Vec<_> = sample.iter().map(|i| target[i]).collect();

        let Ok(hypothesis) = align_points(&src, &tgt, None, SAMPLE_MAX_CONDITION) else {
            continue;
        };

        let (inliers, rmse) = find_inliers(source, target, &hypothesis, config.inlier_threshold);
        let better = best
            .as_ref()
            .map_or(true, |b| inliers.len() > b.inliers.len());
        if better {
            if inliers.len() >= min_inliers {
                let ratio = inliers.len() as f64 / n as f64;
                let needed = adaptive_iterations(ratio, config.confidence, MIN_ALIGNMENT_POINTS);
                max_iter = max_iter.min(iteration.saturating_add(needed));
            }
            best = Some(RansacResult {
                transform: hypothesis,
                inliers,
                iterations: iteration,
                rmse,
            });
        }
    }

    let mut result = best
        .filter(|b| b.inliers.len() >= min_inliers)
        .ok_or(RegistrationError::NoConsensus)?;
    result.iterations = iteration;

    // Refine on the consensus set.
    let src: Vec<_> = result.inliers.iter().map(|&i| source[i]).collect();
    let tgt: Vec<_> = result.inliers.iter().map(|&i| target[i]).collect();
    let refined = align_points(&src, &tgt, None, max_condition)?;
    let (inliers, rmse) = find_inliers(source, target, &refined, config.inlier_threshold);
    if inliers.len() >= result.inliers.len() {
        result.transform = refined;
        result.inliers = inliers;
        result.rmse = rmse;
    }

    Ok(result)
}

/// Valid keypoints of a frame with their descriptors.
pub(crate) struct DescribedCloud {
    pub points: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl DescribedCloud {
    pub fn from_frame(frame: &RgbdFrame) -> Self {
        let (points, descriptors) = frame
            .valid_indices()
            .filter_map(|i| Some((frame.kp_means()[i], frame.descriptors().get(i)?.clone())))
            .unzip();
        Self {
            points,
            descriptors,
        }
    }
}

/// Descriptor-matched RANSAC between two frames, returning `T_target_source`.
pub(crate) fn register_described(
    source: &DescribedCloud,
    target: &DescribedCloud,
    config: &RansacConfig,
    min_inliers: usize,
    max_condition: f64,
    rng: &mut StdRng,
) -> Result<(RansacResult, usize), RegistrationError> {
    let src_desc: Vec<&Descriptor> = source.descriptors.iter().collect();
    let tgt_desc: Vec<&Descriptor> = target.descriptors.iter().collect();
    let matches = match_descriptors(
        &src_desc,
        &tgt_desc,
        config.match_ratio,
        config.max_descriptor_distance,
    );
    require_correspondences(matches.len(), min_inliers)?;

    let src: Vec<_> = matches.iter().map(|m| source.points[m.source]).collect();
    let tgt: Vec<_> = matches.iter().map(|m| target.points[m.target]).collect();
    let result = ransac_rigid(&src, &tgt, config, min_inliers, max_condition, rng)?;
    Ok((result, matches.len()))
}

/// RANSAC against the previous frame.
pub struct Ransac {
    config: RansacConfig,
    min_correspondences: usize,
    max_condition: f64,
    rng: StdRng,
    reference: Option<DescribedCloud>,
}

impl Ransac {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            config: config.ransac.clone(),
            min_correspondences: config.min_correspondences,
            max_condition: config.max_condition_number,
            rng: StdRng::seed_from_u64(config.ransac.seed),
            reference: None,
        }
    }
}

impl MotionEstimator for Ransac {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Ransac
    }

    fn estimate_motion(
        &mut self,
        frame: &Arc<RgbdFrame>,
        _prior: &SE3,
        _prediction: &SE3,
    ) -> Result<MotionEstimate, RegistrationError> {
        let Some(reference) = &self.reference else {
            return Err(RegistrationError::NoReference);
        };

        let current = DescribedCloud::from_frame(frame);
        let result = register_described(
            &current,
            reference,
            &self.config,
            self.min_correspondences,
            self.max_condition,
            &mut self.rng,
        );
        self.reference = Some(current);

        let (result, matches) = result?;
        Ok(MotionEstimate {
            relative: result.transform,
            stats: RegistrationStats {
                correspondences: matches,
                inliers: result.inliers.len(),
                iterations: result.iterations,
                rmse: result.rmse,
            },
        })
    }

    fn observe(&mut self, frame: &Arc<RgbdFrame>, _pose: &SE3) {
        self.reference = Some(DescribedCloud::from_frame(frame));
    }

    fn reset(&mut self) {
        self.reference = None;
        self.rng = StdRng::seed_from_u64(self.config.seed);
    }
}
