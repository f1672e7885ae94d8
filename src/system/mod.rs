//! Pipeline orchestration and thread management.
//!
//! [`RgbdOdometry`] runs the per-frame path on the caller's thread and owns
//! the loop closer thread. Map state shared between the two lives in
//! [`SharedState`]; they talk through the messages in [`messages`].

pub mod messages;
pub mod motion_model;
mod odometry;
pub mod pose_integrator;
pub mod shared_state;

pub use messages::{LoopCorrectionEvent, LoopEvent, LoopRequest, RejectReason, VerifiedLoop};
pub use motion_model::{FallbackPolicy, MotionModel};
pub use odometry::{FrameOutcome, FrameStatus, RgbdOdometry};
pub use pose_integrator::{CorrectionError, PoseIntegrator, TrajectoryPose};
pub use shared_state::{MapState, SharedState};
