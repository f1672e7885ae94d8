//! Particle filter registration.
//!
//! Pose hypotheses are scattered around an initial guess, weighted by how well
//! they align the source keypoints onto the target keypoints, and resampled
//! with a shrinking spread over a fixed number of rounds. The best particle is
//! polished with point-to-point ICP. Because it tolerates poor initial guesses
//! it is used to verify loop closure candidates, where the guess comes from
//! drifted poses.
//!
//! ```text
//! log wᵢ = −½ Σⱼ min(dⱼ², c²) / τ²      dⱼ = nearest-target distance of Tᵢ·pⱼ
//! ```
//!
//! with `τ` the inlier distance and `c = 3τ`.

use std::f64::consts::PI;
use std::sync::Arc;

use nalgebra::{Vector3, Vector6};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::correspondence::PointIndex;
use super::icp::point_to_point_icp;
use super::{
    require_correspondences, EstimatorKind, MotionEstimate, MotionEstimator, RegistrationError,
    RegistrationStats,
};
use crate::config::{IcpConfig, ParticleFilterConfig, RegistrationConfig};
use crate::frame::RgbdFrame;
use crate::geometry::SE3;

/// Spread multiplier applied after each round.
const SIGMA_DECAY: f64 = 0.7;
/// Residual cap in units of the inlier distance.
const TRUNCATION: f64 = 3.0;

/// Verified alignment of two frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleAlignment {
    /// `T_target_source`.
    pub transform: SE3,
    /// Fraction of source keypoints within the inlier distance after alignment.
    pub inlier_ratio: f64,
    /// Log-likelihood of the best particle.
    pub score: f64,
    pub stats: RegistrationStats,
}

pub struct ParticleFilterRegistration {
    config: ParticleFilterConfig,
    icp: IcpConfig,
    min_correspondences: usize,
    max_condition: f64,
    min_inlier_ratio: f64,
    rng: StdRng,
    reference: Option<Arc<RgbdFrame>>,
}

impl ParticleFilterRegistration {
    pub fn new(
        config: ParticleFilterConfig,
        icp: IcpConfig,
        min_correspondences: usize,
        max_condition: f64,
        min_inlier_ratio: f64,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            icp,
            min_correspondences,
            max_condition,
            min_inlier_ratio,
            rng,
            reference: None,
        }
    }

    /// Frame-to-frame estimator configured from the registration and loop closure sections.
    pub fn from_config(
        registration: &RegistrationConfig,
        particles: &ParticleFilterConfig,
        min_inlier_ratio: f64,
    ) -> Self {
        Self::new(
            particles.clone(),
            registration.icp.clone(),
            registration.min_correspondences,
            registration.max_condition_number,
            min_inlier_ratio,
        )
    }

    /// Align `source` onto `target` starting from `guess` (`T_target_source`).
    ///
    /// `cancel` is polled between rounds; returning true aborts the run.
    pub fn align(
        &mut self,
        source: &RgbdFrame,
        target: &RgbdFrame,
        guess: &SE3,
        cancel: &dyn Fn() -> bool,
    ) -> Result<ParticleAlignment, RegistrationError> {
        let source_points = source.feature_point_cloud();
        let target_points = target.feature_point_cloud();
        require_correspondences(source_points.len(), self.min_correspondences)?;
        require_correspondences(target_points.len(), self.min_correspondences)?;
        let index = PointIndex::new(&target_points);

        let n = self.config.particles.max(1);
        let tau = self.config.inlier_distance;
        let mut sigma_t = self.config.translation_sigma;
        let mut sigma_r = self.config.rotation_sigma_deg.to_radians();

        let mut particles: Vec<SE3> = (0..n)
            .map(|i| {
                if i == 0 {
                    *guess
                } else {
                    perturb(guess, sigma_t, sigma_r, &mut self.rng)
                }
            })
            .collect();
        let mut best = (*guess, f64::NEG_INFINITY);

        for _round in 0..self.config.rounds {
            if cancel() {
                return Err(RegistrationError::Aborted);
            }

            let log_weights: Vec<f64> = particles
                .par_iter()
                .map(|t| log_likelihood(&source_points, &index, t, tau))
                .collect();

            for (t, &lw) in particles.iter().zip(&log_weights) {
                if lw > best.1 {
                    best = (*t, lw);
                }
            }

            let weights = normalize(&log_weights);
            let survivors = low_variance_resample(&weights, &mut self.rng);

            sigma_t *= SIGMA_DECAY;
            sigma_r *= SIGMA_DECAY;
            particles = std::iter::once(best.0)
                .chain(
                    survivors
                        .into_iter()
                        .skip(1)
                        .map(|i| perturb(&particles[i], sigma_t, sigma_r, &mut self.rng)),
                )
                .collect();
        }

        if cancel() {
            return Err(RegistrationError::Aborted);
        }

        let (transform, stats) = match point_to_point_icp(
            &source_points,
            &target_points,
            &index,
            &best.0,
            &self.icp,
            self.min_correspondences,
            self.max_condition,
        ) {
            Ok(outcome) => (outcome.transform, outcome.stats),
            Err(err) => {
                tracing::debug!(%err, "ICP refinement failed, keeping best particle");
                (best.0, RegistrationStats::default())
            }
        };

        let inliers = source_points
            .iter()
            .filter(|p| {
                index
                    .nearest(&transform.transform_point(p))
                    .is_some_and(|(_, d)| d <= tau)
            })
            .count();
        let inlier_ratio = inliers as f64 / source_points.len() as f64;

        if inlier_ratio < self.min_inlier_ratio {
            return Err(RegistrationError::LowConfidence {
                inlier_ratio,
                required: self.min_inlier_ratio,
            });
        }

        Ok(ParticleAlignment {
            transform,
            inlier_ratio,
            score: best.1,
            stats: RegistrationStats {
                correspondences: source_points.len(),
                inliers,
                iterations: self.config.rounds,
                rmse: stats.rmse,
            },
        })
    }
}

impl MotionEstimator for ParticleFilterRegistration {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::ParticleFilter
    }

    fn estimate_motion(
        &mut self,
        frame: &Arc<RgbdFrame>,
        _prior: &SE3,
        prediction: &SE3,
    ) -> Result<MotionEstimate, RegistrationError> {
        let Some(reference) = self.reference.replace(Arc::clone(frame)) else {
            self.reference = None;
            return Err(RegistrationError::NoReference);
        };

        let alignment = self.align(frame, &reference, prediction, &|| false)?;
        Ok(MotionEstimate {
            relative: alignment.transform,
            stats: alignment.stats,
        })
    }

    fn observe(&mut self, frame: &Arc<RgbdFrame>, _pose: &SE3) {
        self.reference = Some(Arc::clone(frame));
    }

    fn reset(&mut self) {
        self.reference = None;
        self.rng = StdRng::seed_from_u64(self.config.seed);
    }
}

fn log_likelihood(source: &[Vector3<f64>], index: &PointIndex, transform: &SE3, tau: f64) -> f64 {
    let cap = (TRUNCATION * tau).powi(2);
    let sum: f64 = source
        .iter()
        .map(|p| {
            index
                .nearest(&transform.transform_point(p))
                .map_or(cap, |(_, d)| (d * d).min(cap))
        })
        .sum();
    -0.5 * sum / (tau * tau)
}

/// Log-sum-exp normalisation.
fn normalize(log_weights: &[f64]) -> Vec<f64> {
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0 / log_weights.len() as f64; log_weights.len()];
    }
    let exp: Vec<f64> = log_weights.iter().map(|&lw| (lw - max).exp()).collect();
    let sum: f64 = exp.iter().sum();
    exp.into_iter().map(|w| w / sum).collect()
}

/// Indices of the particles drawn by low-variance resampling.
fn low_variance_resample(weights: &[f64], rng: &mut StdRng) -> Vec<usize> {
    let n = weights.len();
    let step = 1.0 / n as f64;
    let mut r = rng.gen::<f64>() * step;
    let mut cumulative = weights[0];
    let mut idx = 0;

    let mut drawn = Vec::with_capacity(n);
    for _ in 0..n {
        while r > cumulative && idx < n - 1 {
            idx += 1;
            cumulative += weights[idx];
        }
        drawn.push(idx);
        r += step;
    }
    drawn
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    // Box-Muller
    let u1 = rng.gen::<f64>().max(1e-12);
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn perturb(pose: &SE3, sigma_t: f64, sigma_r: f64, rng: &mut StdRng) -> SE3 {
    let mut xi = Vector6::zeros();
    for k in 0..3 {
        xi[k] = sigma_r * standard_normal(rng);
        xi[k + 3] = sigma_t * standard_normal(rng);
    }
    SE3::exp(&xi) * *pose
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SyntheticScene;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    fn registration() -> ParticleFilterRegistration {
        ParticleFilterRegistration::new(
            ParticleFilterConfig::default(),
            IcpConfig::default(),
            10,
            1e8,
            0.5,
        )
    }

    #[test]
    fn test_normalize_sums_to_one() {
        let w = normalize(&[-1000.0, -1001.0, -1002.0]);
        assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(w[0] > w[1] && w[1] > w[2]);
    }

    #[test]
    fn test_resample_follows_weights() {
        let mut rng = StdRng::seed_from_u64(0);
        let drawn = low_variance_resample(&[0.0, 1.0, 0.0, 0.0], &mut rng);
        assert_eq!(drawn, vec![1; 4]);

        let drawn = low_variance_resample(&[0.25; 4], &mut rng);
        assert_eq!(drawn, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_aligns_from_poor_guess() {
        let scene = SyntheticScene::new(23);
        let target = scene.render(&SE3::identity(), 0.0);
        let motion = SE3::from_axis_angle(&Vector3::y(), 0.05, Vector3::new(0.12, 0.0, 0.04));
        let source = scene.render(&motion, 1.0);

        let alignment = registration()
            .align(&source, &target, &SE3::identity(), &|| false)
            .unwrap();

        assert!(alignment.transform.approx_eq(&motion, 5e-3, 5e-3));
        assert!(alignment.inlier_ratio > 0.8);
    }

    #[test]
    fn test_unrelated_frames_are_rejected() {
        let target = SyntheticScene::new(1).render(&SE3::identity(), 0.0);
        let source = SyntheticScene::new(2).render(&SE3::identity(), 1.0);

        let result = registration().align(&source, &target, &SE3::identity(), &|| false);
        assert!(matches!(result, Err(RegistrationError::LowConfidence { .. })));
    }

    #[test]
    fn test_cancel_aborts() {
        let scene = SyntheticScene::new(3);
        let frame = scene.render(&SE3::identity(), 0.0);
        let polls = Cell::new(0);
        let cancel = || {
            polls.set(polls.get() + 1);
            polls.get() > 2
        };

        let result = registration().align(&frame, &frame, &SE3::identity(), &cancel);
        assert_eq!(result.unwrap_err(), RegistrationError::Aborted);
        assert_eq!(polls.get(), 3);
    }

    #[test]
    fn test_estimator_reference_protocol() {
        let scene = SyntheticScene::new(12);
        let first = scene.render(&SE3::identity(), 0.0);
        let motion = SE3::from_translation(Vector3::new(0.02, 0.0, 0.0));
        let second = scene.render(&motion, 0.1);

        let mut estimator = registration();
        assert_eq!(
            estimator
                .estimate_motion(&first, &SE3::identity(), &SE3::identity())
                .unwrap_err(),
            RegistrationError::NoReference
        );
        estimator.observe(&first, &SE3::identity());
        let estimate = estimator
            .estimate_motion(&second, &SE3::identity(), &SE3::identity())
            .unwrap();
        assert!(estimate.relative.approx_eq(&motion, 2e-3, 2e-3));
    }
}
