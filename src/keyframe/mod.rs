//! Keyframe selection and the keyframe pose graph.

pub mod graph;
pub mod manager;
pub mod types;

pub use graph::{EdgeKind, GraphEdge, GraphError, Keyframe, KeyframeGraph};
pub use manager::{KeyframeEvent, KeyframeManager, KeyframeState, PromotionPolicy};
pub use types::KeyframeId;
