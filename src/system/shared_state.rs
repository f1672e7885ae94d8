//! State shared between the odometry pipeline, the loop closer and readers.
//!
//! The keyframe graph, global pose and trajectory live together behind one
//! `RwLock`, so every update (promotion, integration, loop correction) is a
//! single critical section and readers never see a partially applied one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::pose_integrator::PoseIntegrator;
use crate::geometry::SE3;
use crate::keyframe::KeyframeGraph;

#[derive(Debug, Clone, Default)]
pub struct MapState {
    pub graph: KeyframeGraph,
    pub integrator: PoseIntegrator,
}

pub struct SharedState {
    pub map: RwLock<MapState>,

    /// Sequence number of the newest loop closure request.
    latest_loop_request: AtomicU64,

    /// Request the loop closer to exit.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Consistent copy of the whole map state.
    pub fn snapshot(&self) -> MapState {
        self.map.read().clone()
    }

    pub fn global_pose(&self) -> SE3 {
        self.map.read().integrator.pose()
    }

    pub fn publish_loop_request(&self, sequence: u64) {
        self.latest_loop_request.store(sequence, Ordering::SeqCst);
    }

    /// True once a request newer than `sequence` has been published.
    pub fn is_superseded(&self, sequence: u64) -> bool {
        self.latest_loop_request.load(Ordering::SeqCst) > sequence
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            map: RwLock::new(MapState::default()),
            latest_loop_request: AtomicU64::new(0),
            shutdown_requested: AtomicBool::new(false),
        }
    }
}
