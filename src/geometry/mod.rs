//! Geometry utilities: SE3 transforms, SO3 helpers, closed-form rigid alignment.

pub mod alignment;
pub mod se3;
pub mod so3;

pub use alignment::{align_points, alignment_rmse, AlignmentError, MIN_ALIGNMENT_POINTS};
pub use se3::SE3;
pub use so3::skew;
