//! LoopCloser - background loop closure thread.
//!
//! For each request the loop closer:
//! 1. Snapshots the keyframe graph under a read lock
//! 2. Finds candidates close in space but distant in the graph
//! 3. Verifies them, nearest first, with particle filter registration
//! 4. Solves the pose graph extended by the verified loop edge
//! 5. Sends the result back to the pipeline as a [`LoopEvent`]
//!
//! Steps 3 and 4 run without holding any lock. Verification polls the shared
//! request counter and gives up as soon as a newer request is published.
//! Each result carries the number of corrections the snapshot had seen, so
//! the pipeline can refuse one solved against an outdated map.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::detector::find_candidates;
use super::solver::{PoseGraphProblem, PoseGraphSolver};
use crate::config::{LoopClosureConfig, OdometryConfig};
use crate::keyframe::{EdgeKind, GraphEdge};
use crate::registration::{ParticleAlignment, ParticleFilterRegistration, RegistrationError};
use crate::system::{LoopEvent, LoopRequest, RejectReason, SharedState, VerifiedLoop};

/// Timeout for receiving requests from the channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    pub requests_processed: usize,
    pub candidates_detected: usize,
    pub loops_verified: usize,
    pub loops_rejected: usize,
}

pub struct LoopCloser {
    shared: Arc<SharedState>,
    config: LoopClosureConfig,
    verifier: ParticleFilterRegistration,
    solver: Box<dyn PoseGraphSolver>,
    stats: LoopCloserStats,
}

impl LoopCloser {
    pub fn new(
        shared: Arc<SharedState>,
        config: &OdometryConfig,
        solver: Box<dyn PoseGraphSolver>,
    ) -> Self {
        let verifier = ParticleFilterRegistration::from_config(
            &config.registration,
            &config.loop_closure.particles,
            config.loop_closure.min_inlier_ratio,
        );
        Self {
            shared,
            config: config.loop_closure.clone(),
            verifier,
            solver,
            stats: LoopCloserStats::default(),
        }
    }

    /// Process requests until the channel closes or shutdown is requested.
    pub fn run(&mut self, requests: Receiver<LoopRequest>, events: Sender<LoopEvent>) {
        tracing::info!("LoopCloser thread started");

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            match requests.recv_timeout(RECV_TIMEOUT) {
                Ok(request) => {
                    let event = self.process(request);
                    if events.send(event).is_err() {
                        tracing::info!("LoopCloser event receiver dropped");
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("LoopCloser channel disconnected");
                    break;
                }
            }
        }

        tracing::info!(
            processed = self.stats.requests_processed,
            detected = self.stats.candidates_detected,
            verified = self.stats.loops_verified,
            rejected = self.stats.loops_rejected,
            "LoopCloser thread exiting"
        );
    }

    /// Scan for, verify and solve a closure of `request.keyframe`.
    pub fn process(&mut self, request: LoopRequest) -> LoopEvent {
        self.stats.requests_processed += 1;
        let query = request.keyframe;
        let reject = |stats: &mut LoopCloserStats, reason: RejectReason| {
            stats.loops_rejected += 1;
            tracing::debug!(keyframe = %query, %reason, "Loop closure rejected");
            LoopEvent::Rejected { query, reason }
        };

        if self.shared.is_superseded(request.sequence) {
            return reject(&mut self.stats, RejectReason::Superseded);
        }

        // Phase 1: collect under the read lock.
        let (graph, generation) = {
            let map = self.shared.map.read();
            (map.graph.clone(), map.integrator.corrections())
        };
        let candidates = find_candidates(&graph, query, &self.config);
        let Some(query_kf) = graph.get(query).filter(|_| !candidates.is_empty()) else {
            return reject(&mut self.stats, RejectReason::NoCandidates);
        };
        self.stats.candidates_detected += candidates.len();

        // Phase 2: verify without holding any lock.
        let shared = Arc::clone(&self.shared);
        let cancel = move || shared.is_superseded(request.sequence) || shared.is_shutdown_requested();

        let mut verified: Option<(ParticleAlignment, _)> = None;
        let mut last_error = RegistrationError::NoReference;
        for candidate in &candidates {
            let Some(candidate_kf) = graph.get(candidate.candidate) else {
                continue;
            };
            let guess = candidate_kf.pose.between(&query_kf.pose);
            match self
                .verifier
                .align(&query_kf.frame, &candidate_kf.frame, &guess, &cancel)
            {
                Ok(alignment) => {
                    verified = Some((alignment, candidate.candidate));
                    break;
                }
                Err(RegistrationError::Aborted) => {
                    return reject(&mut self.stats, RejectReason::Superseded);
                }
                Err(err) => {
                    tracing::debug!(
                        query = %query,
                        candidate = %candidate.candidate,
                        %err,
                        "Loop candidate failed verification"
                    );
                    last_error = err;
                }
            }
        }

        let Some((alignment, candidate)) = verified else {
            return reject(&mut self.stats, RejectReason::Verification(last_error));
        };

        // Phase 3: solve the graph extended by the new loop edge.
        let mut problem = PoseGraphProblem::from_graph(&graph);
        problem.edges.push(GraphEdge {
            source: query,
            target: candidate,
            transform: alignment.transform.inverse(),
            weight: alignment.inlier_ratio,
            kind: EdgeKind::Loop,
        });

        let corrected = match self.solver.optimize(&problem) {
            Ok(corrected) => corrected,
            Err(err) => return reject(&mut self.stats, RejectReason::Solver(err)),
        };

        self.stats.loops_verified += 1;
        tracing::info!(
            query = %query,
            candidate = %candidate,
            inlier_ratio = alignment.inlier_ratio,
            "Loop closure verified"
        );

        LoopEvent::Accepted(VerifiedLoop {
            query,
            candidate,
            transform: alignment.transform,
            inlier_ratio: alignment.inlier_ratio,
            previous: problem.poses,
            corrected,
            generation,
        })
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }
}

/// Spawn the loop closer thread.
pub fn spawn_loop_closer(
    shared: Arc<SharedState>,
    config: &OdometryConfig,
    solver: Box<dyn PoseGraphSolver>,
    requests: Receiver<LoopRequest>,
    events: Sender<LoopEvent>,
) -> thread::JoinHandle<()> {
    let mut loop_closer = LoopCloser::new(shared, config, solver);
    thread::spawn(move || loop_closer.run(requests, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::keyframe::KeyframeId;
    use crate::loop_closing::RigidRebaseSolver;
    use crate::system::CorrectionError;
    use crate::test_support::SyntheticScene;
    use nalgebra::Vector3;

    /// Out 0.6 m and back in 12 keyframes; the last one carries drift.
    fn out_and_back(shared: &SharedState) {
        out_and_back_to(shared, 12);
    }

    /// Like [`out_and_back`], with keyframes past 12 resting at the origin.
    /// Every keyframe from 12 on carries the same drift.
    fn out_and_back_to(shared: &SharedState, last: usize) {
        let scene = SyntheticScene::new(77);
        let mut map = shared.map.write();
        let mut previous = SE3::identity();
        for i in 0..=last {
            let x = 0.1 * (if i <= 6 { i } else { 12usize.saturating_sub(i) }) as f64;
            let truth = SE3::from_translation(Vector3::new(x, 0.0, 0.0));
            let estimate = if i >= 12 {
                SE3::from_translation(Vector3::new(0.04, 0.02, 0.0))
            } else {
                truth
            };
            let frame = scene.render(&truth, i as f64);
            map.graph
                .push_keyframe(frame, estimate, previous.between(&estimate));
            previous = estimate;
        }
    }

    fn loop_closer(shared: &Arc<SharedState>) -> LoopCloser {
        LoopCloser::new(
            Arc::clone(shared),
            &OdometryConfig::default(),
            Box::new(RigidRebaseSolver),
        )
    }

    #[test]
    fn test_closes_drifted_loop() {
        let shared = SharedState::new();
        out_and_back(&shared);
        let mut closer = loop_closer(&shared);

        let event = closer.process(LoopRequest {
            keyframe: KeyframeId::new(12),
            sequence: 0,
        });

        let LoopEvent::Accepted(verified) = event else {
            panic!("expected acceptance, got {event:?}");
        };
        assert_eq!(verified.candidate, KeyframeId::new(0));
        assert!(verified.inlier_ratio > 0.9);
        assert!(verified.transform.approx_eq(&SE3::identity(), 5e-3, 5e-3));
        assert!(verified.corrected[12].approx_eq(&SE3::identity(), 5e-3, 5e-3));
        assert_eq!(verified.corrected[..12], verified.previous[..12]);
        assert_eq!(closer.stats().loops_verified, 1);
        // The shared map is untouched until the pipeline applies the event.
        assert_eq!(shared.snapshot().graph.loop_edges().count(), 0);
    }

    #[test]
    fn test_back_to_back_closures_correct_once() {
        let shared = SharedState::new();
        out_and_back_to(&shared, 13);
        let mut closer = loop_closer(&shared);

        // Both requests are solved before the pipeline applies either.
        let events: Vec<LoopEvent> = [12, 13]
            .into_iter()
            .enumerate()
            .map(|(sequence, id)| {
                closer.process(LoopRequest {
                    keyframe: KeyframeId::new(id),
                    sequence: sequence as u64,
                })
            })
            .collect();

        let mut results = Vec::new();
        for event in &events {
            let LoopEvent::Accepted(verified) = event else {
                panic!("expected acceptance, got {event:?}");
            };
            assert_eq!(verified.generation, 0);
            let mut map = shared.map.write();
            let state = &mut *map;
            results.push(
                state
                    .integrator
                    .apply_loop_correction(&mut state.graph, verified),
            );
        }

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(CorrectionError::Stale { .. })));
        let snapshot = shared.snapshot();
        for id in [12, 13] {
            let pose = snapshot.graph.get(KeyframeId::new(id)).unwrap().pose;
            assert!(pose.approx_eq(&SE3::identity(), 5e-3, 5e-3), "keyframe {id} at {pose}");
        }
        assert_eq!(snapshot.graph.loop_edges().count(), 1);
    }

    #[test]
    fn test_no_candidates() {
        let shared = SharedState::new();
        out_and_back(&shared);
        let mut closer = loop_closer(&shared);

        let event = closer.process(LoopRequest {
            keyframe: KeyframeId::new(3),
            sequence: 0,
        });
        assert_eq!(
            event,
            LoopEvent::Rejected {
                query: KeyframeId::new(3),
                reason: RejectReason::NoCandidates
            }
        );
    }

    #[test]
    fn test_superseded_request_is_skipped() {
        let shared = SharedState::new();
        out_and_back(&shared);
        shared.publish_loop_request(2);
        let mut closer = loop_closer(&shared);

        let event = closer.process(LoopRequest {
            keyframe: KeyframeId::new(12),
            sequence: 1,
        });
        assert!(matches!(
            event,
            LoopEvent::Rejected {
                reason: RejectReason::Superseded,
                ..
            }
        ));
    }

    #[test]
    fn test_thread_round_trip() {
        let shared = SharedState::new();
        out_and_back(&shared);
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let handle = spawn_loop_closer(
            Arc::clone(&shared),
            &OdometryConfig::default(),
            Box::new(RigidRebaseSolver),
            request_rx,
            event_tx,
        );

        request_tx
            .send(LoopRequest {
                keyframe: KeyframeId::new(12),
                sequence: 0,
            })
            .unwrap();
        let event = event_rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert!(matches!(event, LoopEvent::Accepted(_)));

        shared.request_shutdown();
        handle.join().unwrap();
    }
}
