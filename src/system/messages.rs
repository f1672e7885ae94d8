//! Messages exchanged between the odometry pipeline and the loop closer.
//!
//! The loop closer never mutates the map itself. It verifies candidates and
//! solves the pose graph on a private copy, then hands the result back as a
//! [`LoopEvent`]; the pipeline applies accepted closures in one critical
//! section before processing its next frame.

use crate::geometry::SE3;
use crate::keyframe::KeyframeId;
use crate::loop_closing::SolverError;
use crate::registration::RegistrationError;

/// Ask the loop closer to scan for closures of a new keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRequest {
    pub keyframe: KeyframeId,
    /// Monotonic request counter; a newer request supersedes older ones.
    pub sequence: u64,
}

/// A verified and solved loop closure, not yet applied.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedLoop {
    pub query: KeyframeId,
    pub candidate: KeyframeId,
    /// `T_candidate_query` from verification.
    pub transform: SE3,
    pub inlier_ratio: f64,
    /// Keyframe poses the solver started from, indexed by keyframe id.
    pub previous: Vec<SE3>,
    /// Corrected keyframe poses returned by the solver.
    pub corrected: Vec<SE3>,
    /// Loop corrections already applied to the map when it was snapshotted.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NoCandidates,
    /// A newer request arrived before verification finished.
    Superseded,
    Verification(RegistrationError),
    Solver(SolverError),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NoCandidates => write!(f, "no candidates"),
            RejectReason::Superseded => write!(f, "superseded"),
            RejectReason::Verification(err) => write!(f, "verification failed: {err}"),
            RejectReason::Solver(err) => write!(f, "solver failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Accepted(VerifiedLoop),
    Rejected {
        query: KeyframeId,
        reason: RejectReason,
    },
}

/// A loop closure that has been applied to the map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopCorrectionEvent {
    pub query: KeyframeId,
    pub candidate: KeyframeId,
    /// Earliest keyframe whose pose changed, `None` if the solver moved nothing.
    pub first_affected: Option<KeyframeId>,
    /// `T_new_old` applied to the running global pose.
    pub correction: SE3,
    pub inlier_ratio: f64,
}
