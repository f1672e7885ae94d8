//! Lazily constructed set of motion estimators with one active at a time.
//!
//! Switching strategies mid-run keeps the other estimators alive. An estimator
//! that was idle while frames went by is re-seeded with the latest frame and
//! pose before it is used again, so it never registers against a stale
//! reference.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    EstimatorKind, Icp, IcpModel, IcpProbModel, MotionEstimate, MotionEstimator,
    ParticleFilterRegistration, Ransac, RansacModel, RegistrationError,
};
use crate::config::OdometryConfig;
use crate::frame::RgbdFrame;
use crate::geometry::SE3;

struct Slot {
    estimator: Box<dyn MotionEstimator>,
    /// Sequence number of the last frame this estimator saw.
    synced: u64,
}

pub struct EstimatorBank {
    config: OdometryConfig,
    active: EstimatorKind,
    slots: HashMap<EstimatorKind, Slot>,
    sequence: u64,
    last: Option<(Arc<RgbdFrame>, SE3)>,
}

impl EstimatorBank {
    pub fn new(config: &OdometryConfig) -> Self {
        Self {
            config: config.clone(),
            active: config.registration.estimator,
            slots: HashMap::new(),
            sequence: 0,
            last: None,
        }
    }

    pub fn active(&self) -> EstimatorKind {
        self.active
    }

    /// Make `kind` the active strategy for subsequent frames.
    pub fn select(&mut self, kind: EstimatorKind) {
        if kind != self.active {
            tracing::info!(from = %self.active, to = %kind, "Switching motion estimator");
            self.active = kind;
        }
    }

    /// Active estimator, created and brought up to date if needed.
    fn active_slot(&mut self) -> &mut Slot {
        let kind = self.active;
        let config = &self.config;
        let slot = self.slots.entry(kind).or_insert_with(|| Slot {
            estimator: build_estimator(config, kind),
            synced: 0,
        });

        if slot.synced != self.sequence {
            if let Some((frame, pose)) = &self.last {
                tracing::debug!(estimator = %kind, "Re-seeding estimator with latest frame");
                slot.estimator.observe(frame, pose);
            }
            slot.synced = self.sequence;
        }
        slot
    }

    /// Register `frame` with the active estimator.
    pub fn estimate_motion(
        &mut self,
        frame: &Arc<RgbdFrame>,
        prior: &SE3,
        prediction: &SE3,
    ) -> Result<MotionEstimate, RegistrationError> {
        self.active_slot()
            .estimator
            .estimate_motion(frame, prior, prediction)
    }

    /// Seed the active estimator with `frame` at `pose` without registering.
    pub fn observe(&mut self, frame: &Arc<RgbdFrame>, pose: &SE3) {
        self.active_slot().estimator.observe(frame, pose);
    }

    /// Record the final pose of a processed frame.
    ///
    /// Must be called once per frame after `estimate_motion` and/or `observe`.
    pub fn record(&mut self, frame: &Arc<RgbdFrame>, pose: &SE3) {
        self.sequence += 1;
        self.last = Some((Arc::clone(frame), *pose));
        if let Some(slot) = self.slots.get_mut(&self.active) {
            slot.synced = self.sequence;
        }
    }

    /// Apply a world-frame correction to every estimator and the cached pose.
    pub fn rebase(&mut self, correction: &SE3) {
        for slot in self.slots.values_mut() {
            slot.estimator.rebase(correction);
        }
        if let Some((_, pose)) = &mut self.last {
            *pose = correction * &*pose;
        }
    }

    pub fn reset(&mut self) {
        for slot in self.slots.values_mut() {
            slot.estimator.reset();
            slot.synced = 0;
        }
        self.sequence = 0;
        self.last = None;
    }
}

fn build_estimator(config: &OdometryConfig, kind: EstimatorKind) -> Box<dyn MotionEstimator> {
    let registration = &config.registration;
    match kind {
        EstimatorKind::Icp => Box::new(Icp::new(registration)),
        EstimatorKind::IcpModel => Box::new(IcpModel::new(registration)),
        EstimatorKind::IcpProbModel => Box::new(IcpProbModel::new(registration)),
        EstimatorKind::Ransac => Box::new(Ransac::new(registration)),
        EstimatorKind::RansacModel => Box::new(RansacModel::new(registration)),
        EstimatorKind::ParticleFilter => Box::new(ParticleFilterRegistration::from_config(
            registration,
            &config.loop_closure.particles,
            config.loop_closure.min_inlier_ratio,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SyntheticScene;
    use nalgebra::Vector3;

    fn step(bank: &mut EstimatorBank, frame: &Arc<RgbdFrame>, pose: &SE3) -> Option<SE3> {
        let result = match bank.estimate_motion(frame, pose, &SE3::identity()) {
            Ok(estimate) => Some(pose * &estimate.relative),
            Err(RegistrationError::NoReference) => {
                bank.observe(frame, pose);
                None
            }
            Err(err) => panic!("unexpected {err}"),
        };
        bank.record(frame, &result.unwrap_or(*pose));
        result
    }

    #[test]
    fn test_default_estimator() {
        let bank = EstimatorBank::new(&OdometryConfig::default());
        assert_eq!(bank.active(), EstimatorKind::IcpProbModel);
    }

    #[test]
    fn test_switch_reseeds_idle_estimator() {
        let scene = SyntheticScene::new(40);
        let motion = SE3::from_translation(Vector3::new(0.01, 0.0, 0.0));
        let mut bank = EstimatorBank::new(&OdometryConfig::default());
        bank.select(EstimatorKind::Icp);

        let mut truth = SE3::identity();
        let mut pose = SE3::identity();
        assert!(step(&mut bank, &scene.render(&truth, 0.0), &pose).is_none());

        truth = truth * motion;
        pose = step(&mut bank, &scene.render(&truth, 0.1), &pose).unwrap();

        // The model estimator was never used, yet it registers immediately.
        bank.select(EstimatorKind::IcpProbModel);
        truth = truth * motion;
        pose = step(&mut bank, &scene.render(&truth, 0.2), &pose).unwrap();

        assert!(pose.approx_eq(&truth, 5e-3, 5e-3));
    }

    #[test]
    fn test_rebase_moves_cached_pose() {
        let scene = SyntheticScene::new(41);
        let mut bank = EstimatorBank::new(&OdometryConfig::default());
        let frame = scene.render(&SE3::identity(), 0.0);
        bank.observe(&frame, &SE3::identity());
        bank.record(&frame, &SE3::identity());

        let shift = SE3::from_translation(Vector3::new(0.0, 0.0, 1.0));
        bank.rebase(&shift);

        let (_, pose) = bank.last.as_ref().unwrap();
        assert!(pose.approx_eq(&shift, 1e-12, 1e-12));
    }
}
