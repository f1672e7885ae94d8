//! RgbdOdometry - the per-frame entry point.
//!
//! Frames are processed strictly in arrival order on the caller's thread:
//! motion estimation, pose integration and keyframe promotion. The loop
//! closer runs on its own thread; its verified closures are applied at the
//! start of the next processed frame (or on an explicit poll), each in one
//! write-locked critical section.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;

use super::messages::{LoopCorrectionEvent, LoopEvent, LoopRequest};
use super::motion_model::MotionModel;
use super::pose_integrator::{CorrectionError, TrajectoryPose};
use super::shared_state::{MapState, SharedState};
use crate::config::OdometryConfig;
use crate::frame::{CameraModel, DepthImage, DepthModel, FeatureSet, FrameHeader, RgbdFrame};
use crate::geometry::SE3;
use crate::keyframe::{KeyframeEvent, KeyframeId, KeyframeManager, KeyframeState};
use crate::loop_closing::{spawn_loop_closer, PoseGraphSolver, RigidRebaseSolver};
use crate::registration::{EstimatorBank, EstimatorKind, RegistrationError, RegistrationStats};

/// Capacity of the request channel to the loop closer. Requests that do not
/// fit are dropped; a newer one supersedes them anyway.
const LOOP_REQUEST_CAPACITY: usize = 8;

/// How a frame's motion was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameStatus {
    /// The active estimator had no reference and took this frame as one.
    Initialized,
    /// Registration succeeded.
    Tracked(RegistrationStats),
    /// Registration failed and the motion model supplied the motion.
    Fallback(RegistrationError),
    /// Timestamp older than the previous frame; nothing was updated.
    OutOfOrder { last_timestamp: f64 },
}

/// Result of processing one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub timestamp: f64,
    pub status: FrameStatus,
    /// Motion applied to the global pose, `T_prev_curr`.
    pub relative: SE3,
    /// Global pose after this frame.
    pub pose: SE3,
    pub keyframe: Option<KeyframeEvent>,
    /// Loop closures applied since the previous frame.
    pub loop_corrections: Vec<LoopCorrectionEvent>,
}

impl FrameOutcome {
    pub fn is_tracked(&self) -> bool {
        matches!(self.status, FrameStatus::Tracked(_))
    }
}

struct LoopClosureLink {
    requests: Sender<LoopRequest>,
    events: Receiver<LoopEvent>,
    handle: JoinHandle<()>,
    /// Requests sent that have not been answered yet.
    outstanding: usize,
}

pub struct RgbdOdometry {
    config: OdometryConfig,
    depth_model: DepthModel,
    shared: Arc<SharedState>,
    bank: EstimatorBank,
    keyframes: KeyframeManager,
    motion_model: MotionModel,
    last_timestamp: Option<f64>,
    loop_sequence: u64,
    loop_link: Option<LoopClosureLink>,
}

impl RgbdOdometry {
    /// Pipeline with the built-in pose-graph solver.
    pub fn new(config: OdometryConfig) -> Result<Self> {
        Self::with_solver(config, Box::new(RigidRebaseSolver))
    }

    /// Pipeline whose loop closer hands pose graphs to `solver`.
    pub fn with_solver(config: OdometryConfig, solver: Box<dyn PoseGraphSolver>) -> Result<Self> {
        config.validate().context("invalid odometry config")?;

        let shared = SharedState::new();
        let loop_link = config.loop_closure.enabled.then(|| {
            let (request_tx, request_rx) = bounded(LOOP_REQUEST_CAPACITY);
            let (event_tx, event_rx) = unbounded();
            let handle =
                spawn_loop_closer(Arc::clone(&shared), &config, solver, request_rx, event_tx);
            LoopClosureLink {
                requests: request_tx,
                events: event_rx,
                handle,
                outstanding: 0,
            }
        });

        tracing::info!(
            estimator = %config.registration.estimator,
            loop_closure = config.loop_closure.enabled,
            "RGB-D odometry started"
        );

        Ok(Self {
            depth_model: DepthModel::new(&config.depth),
            bank: EstimatorBank::new(&config),
            keyframes: KeyframeManager::new(&config.keyframes),
            motion_model: MotionModel::new(config.registration.fallback),
            shared,
            config,
            last_timestamp: None,
            loop_sequence: 0,
            loop_link,
        })
    }

    pub fn config(&self) -> &OdometryConfig {
        &self.config
    }

    /// Build a frame from one synchronised image pair and process it.
    pub fn process(
        &mut self,
        header: FrameHeader,
        camera: CameraModel,
        rgb: RgbImage,
        depth: DepthImage,
        features: FeatureSet,
    ) -> Result<FrameOutcome> {
        let timestamp = header.timestamp;
        let frame = RgbdFrame::new(header, camera, rgb, depth, self.depth_model.depth_scale())
            .with_context(|| format!("rejected image pair at t={timestamp:.6}"))?
            .with_features(features, &self.depth_model);
        Ok(self.process_frame(Arc::new(frame)))
    }

    /// Process a frame whose features are already attached.
    pub fn process_frame(&mut self, frame: Arc<RgbdFrame>) -> FrameOutcome {
        let timestamp = frame.timestamp();
        let loop_corrections = self.poll_loop_events();

        if let Some(last_timestamp) = self.last_timestamp.filter(|&last| timestamp < last) {
            tracing::warn!(timestamp, last_timestamp, "Dropping out-of-order frame");
            return FrameOutcome {
                timestamp,
                status: FrameStatus::OutOfOrder { last_timestamp },
                relative: SE3::identity(),
                pose: self.shared.global_pose(),
                keyframe: None,
                loop_corrections,
            };
        }

        let prior = self.shared.global_pose();
        let prediction = self.motion_model.predict();

        let (status, relative) = match self.bank.estimate_motion(&frame, &prior, &prediction) {
            Ok(estimate) => {
                tracing::debug!(
                    timestamp,
                    estimator = %self.bank.active(),
                    correspondences = estimate.stats.correspondences,
                    inliers = estimate.stats.inliers,
                    iterations = estimate.stats.iterations,
                    rmse = estimate.stats.rmse,
                    "Registered frame"
                );
                self.motion_model.update(&estimate.relative);
                (FrameStatus::Tracked(estimate.stats), estimate.relative)
            }
            Err(RegistrationError::NoReference) => {
                self.bank.observe(&frame, &prior);
                (FrameStatus::Initialized, SE3::identity())
            }
            Err(err) => {
                tracing::warn!(
                    timestamp,
                    estimator = %self.bank.active(),
                    %err,
                    policy = ?self.motion_model.policy(),
                    "Motion estimation failed, using motion model"
                );
                (FrameStatus::Fallback(err), prediction)
            }
        };

        let (pose, keyframe) = {
            let mut map = self.shared.map.write();
            let state = &mut *map;
            let pose = state.integrator.advance(&relative);
            let stats = match &status {
                FrameStatus::Tracked(stats) => Some(stats),
                _ => None,
            };
            let (active, event) = match self.keyframes.step(&mut state.graph, &frame, &pose, stats) {
                KeyframeState::Tracking { keyframe, .. } => (keyframe, None),
                KeyframeState::Promoted(event) => (event.id, Some(event)),
            };
            state.integrator.record(timestamp, active);
            (pose, event)
        };

        self.bank.record(&frame, &pose);
        self.last_timestamp = Some(timestamp);

        if let Some(event) = &keyframe {
            self.request_loop_scan(event.id);
        }

        FrameOutcome {
            timestamp,
            status,
            relative,
            pose,
            keyframe,
            loop_corrections,
        }
    }

    /// Switch the motion estimator used for subsequent frames.
    pub fn select_estimator(&mut self, kind: EstimatorKind) {
        self.bank.select(kind);
    }

    pub fn active_estimator(&self) -> EstimatorKind {
        self.bank.active()
    }

    /// Apply every loop closure the loop closer has finished so far.
    pub fn poll_loop_events(&mut self) -> Vec<LoopCorrectionEvent> {
        let pending: Vec<LoopEvent> = match &mut self.loop_link {
            Some(link) => {
                let events: Vec<LoopEvent> = link.events.try_iter().collect();
                link.outstanding = link.outstanding.saturating_sub(events.len());
                events
            }
            None => return Vec::new(),
        };

        pending
            .into_iter()
            .filter_map(|event| self.apply_loop_event(event))
            .collect()
    }

    /// Wait until every pending loop request is answered or `timeout` passes,
    /// applying accepted closures as they arrive.
    pub fn flush_loop_closure(&mut self, timeout: Duration) -> Vec<LoopCorrectionEvent> {
        let deadline = Instant::now() + timeout;
        let mut applied = Vec::new();

        loop {
            let event = match &mut self.loop_link {
                Some(link) if link.outstanding > 0 => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match link.events.recv_timeout(remaining) {
                        Ok(event) => {
                            link.outstanding -= 1;
                            event
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            tracing::warn!(
                                outstanding = link.outstanding,
                                "Timed out waiting for loop closer"
                            );
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                _ => break,
            };
            applied.extend(self.apply_loop_event(event));
        }

        applied
    }

    fn apply_loop_event(&mut self, event: LoopEvent) -> Option<LoopCorrectionEvent> {
        let closure = match event {
            LoopEvent::Accepted(closure) => closure,
            LoopEvent::Rejected { query, reason } => {
                tracing::debug!(keyframe = %query, %reason, "No loop closure");
                return None;
            }
        };

        let result = {
            let mut map = self.shared.map.write();
            let state = &mut *map;
            state
                .integrator
                .apply_loop_correction(&mut state.graph, &closure)
        };

        match result {
            Ok(correction) => {
                self.bank.rebase(&correction.correction);
                tracing::info!(
                    query = %correction.query,
                    candidate = %correction.candidate,
                    first_affected = ?correction.first_affected,
                    shift = correction.correction.translation_norm(),
                    "Applied loop closure"
                );
                Some(correction)
            }
            Err(err @ CorrectionError::Stale { .. }) => {
                tracing::debug!(%err, query = %closure.query, "Discarding stale loop closure");
                None
            }
            Err(err) => {
                tracing::warn!(%err, query = %closure.query, "Discarding loop closure");
                None
            }
        }
    }

    fn request_loop_scan(&mut self, keyframe: KeyframeId) {
        let interval = self.config.loop_closure.scan_interval as u64;
        let Some(link) = &mut self.loop_link else {
            return;
        };
        if keyframe.0 == 0 || keyframe.0 % interval != 0 {
            return;
        }

        self.loop_sequence += 1;
        let request = LoopRequest {
            keyframe,
            sequence: self.loop_sequence,
        };
        self.shared.publish_loop_request(request.sequence);
        match link.requests.try_send(request) {
            Ok(()) => link.outstanding += 1,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(keyframe = %keyframe, "Loop closer busy, skipping scan");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("Loop closer thread is gone");
            }
        }
    }

    pub fn pose(&self) -> SE3 {
        self.shared.global_pose()
    }

    pub fn trajectory(&self) -> Vec<TrajectoryPose> {
        self.shared.map.read().integrator.trajectory().to_vec()
    }

    /// Consistent copy of the keyframe graph, global pose and trajectory.
    pub fn snapshot(&self) -> MapState {
        self.shared.snapshot()
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Stop the loop closer and wait for it. Pending closures are discarded.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(link) = self.loop_link.take() {
            drop(link.requests);
            if link.handle.join().is_err() {
                tracing::error!("Loop closer thread panicked");
            }
        }
    }
}

impl Drop for RgbdOdometry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
