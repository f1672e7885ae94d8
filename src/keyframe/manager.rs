//! Keyframe promotion.
//!
//! Each processed frame is either tracked against the active keyframe or
//! promoted to become the new active keyframe. Promotion is decided from the
//! motion accumulated since the active keyframe, from the decay of the
//! registration inlier count relative to the keyframe's valid keypoints, or
//! from either of the two.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::graph::KeyframeGraph;
use super::types::KeyframeId;
use crate::config::KeyframeConfig;
use crate::frame::RgbdFrame;
use crate::geometry::SE3;
use crate::registration::RegistrationStats;

/// Criterion for promoting the current frame to a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionPolicy {
    /// Translation or rotation since the active keyframe exceeds its bound.
    #[default]
    Displacement,
    /// Inliers drop below a fraction of the keyframe's valid keypoints.
    CorrespondenceDecay,
    /// Whichever of the two triggers first.
    Either,
}

/// Outcome of one frame for the keyframe state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyframeState {
    /// The frame was tracked against `keyframe`, displaced by `offset`.
    Tracking { keyframe: KeyframeId, offset: SE3 },
    /// The frame became the new active keyframe.
    Promoted(KeyframeEvent),
}

/// A newly promoted keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyframeEvent {
    pub id: KeyframeId,
    pub pose: SE3,
    pub timestamp: f64,
    /// `T_previous_new`, identity for the first keyframe.
    pub relative: SE3,
}

pub struct KeyframeManager {
    config: KeyframeConfig,
    active: Option<KeyframeId>,
}

impl KeyframeManager {
    pub fn new(config: &KeyframeConfig) -> Self {
        Self {
            config: config.clone(),
            active: None,
        }
    }

    /// Keyframe the pipeline is currently tracking against.
    pub fn active(&self) -> Option<KeyframeId> {
        self.active
    }

    /// Advance the state machine by one frame at world `pose`.
    ///
    /// `registration` holds the statistics of a successful motion estimate,
    /// or `None` when the pose came from the fallback model; only successful
    /// estimates may promote, except for the very first keyframe. At most one
    /// keyframe is promoted per call.
    pub fn step(
        &mut self,
        graph: &mut KeyframeGraph,
        frame: &Arc<RgbdFrame>,
        pose: &SE3,
        registration: Option<&RegistrationStats>,
    ) -> KeyframeState {
        let active = self.active.and_then(|id| graph.get(id));

        let Some(keyframe) = active else {
            return self.promote(graph, frame, pose, SE3::identity());
        };

        let keyframe_id = keyframe.id;
        let offset = keyframe.pose.inverse() * *pose;
        let keyframe_valid = keyframe.frame.n_valid_keypoints();
        let promote =
            registration.is_some_and(|stats| self.should_promote(&offset, stats, keyframe_valid));

        if promote {
            self.promote(graph, frame, pose, offset)
        } else {
            KeyframeState::Tracking {
                keyframe: keyframe_id,
                offset,
            }
        }
    }

    fn should_promote(
        &self,
        offset: &SE3,
        stats: &RegistrationStats,
        keyframe_valid: usize,
    ) -> bool {
        let displaced = offset.translation_norm() > self.config.max_translation
            || offset.rotation_angle() > self.config.max_rotation_deg.to_radians();
        let decayed = keyframe_valid > 0
            && (stats.inliers as f64) < self.config.min_correspondence_ratio * keyframe_valid as f64;

        match self.config.policy {
            PromotionPolicy::Displacement => displaced,
            PromotionPolicy::CorrespondenceDecay => decayed,
            PromotionPolicy::Either => displaced || decayed,
        }
    }

    fn promote(
        &mut self,
        graph: &mut KeyframeGraph,
        frame: &Arc<RgbdFrame>,
        pose: &SE3,
        relative: SE3,
    ) -> KeyframeState {
        let id = graph.push_keyframe(Arc::clone(frame), *pose, relative);
        self.active = Some(id);
        tracing::info!(
            keyframe = %id,
            timestamp = frame.timestamp(),
            keyframes = graph.len(),
            "Promoted keyframe"
        );
        KeyframeState::Promoted(KeyframeEvent {
            id,
            pose: *pose,
            timestamp: frame.timestamp(),
            relative,
        })
    }

    pub fn reset(&mut self) {
        self.active = None;
    }
}
