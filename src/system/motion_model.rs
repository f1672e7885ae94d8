//! Constant-velocity motion prediction.
//!
//! The last successfully estimated relative motion is the prediction for the
//! next frame. It seeds registration, and it stands in for the estimate when
//! registration fails.

use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// Motion assumed for a frame whose registration failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Assume the camera did not move.
    Identity,
    /// Assume the camera repeated its last estimated motion.
    #[default]
    ConstantVelocity,
}

pub struct MotionModel {
    policy: FallbackPolicy,
    /// Last estimated `T_prev_curr`.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new(policy: FallbackPolicy) -> Self {
        Self {
            policy,
            velocity: None,
        }
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    /// Update the model with a successfully estimated relative motion.
    pub fn update(&mut self, relative: &SE3) {
        self.velocity = Some(*relative);
    }

    /// Predicted relative motion of the next frame.
    pub fn predict(&self) -> SE3 {
        match (self.policy, self.velocity) {
            (FallbackPolicy::ConstantVelocity, Some(velocity)) => velocity,
            _ => SE3::identity(),
        }
    }

    pub fn reset(&mut self) {
        self.velocity = None;
    }
}

impl Default for MotionModel {
    fn default() -> Self {
        Self::new(FallbackPolicy::default())
    }
}
