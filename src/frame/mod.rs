//! Frame-level data: camera intrinsics, depth uncertainty, external features,
//! the `RgbdFrame` entity and its on-disk format.

pub mod camera;
pub mod depth_model;
pub mod features;
pub mod persistence;
pub mod rgbd_frame;

pub use camera::CameraModel;
pub use depth_model::{DepthImage, DepthModel, DepthModelKind, PointDistribution};
pub use features::{Descriptor, FeatureError, FeatureSet, FeatureSource, Keypoint, QueuedFeatures};
pub use persistence::{load_frame, save_frame, PersistenceError};
pub use rgbd_frame::{FrameError, FrameHeader, RgbdFrame};
