//! Running global pose and trajectory.
//!
//! The global pose is the left-to-right product of every relative motion
//! since the first frame. An accepted loop closure re-bases, rigidly and per
//! keyframe, everything from the earliest keyframe the solver moved onward:
//! keyframe poses, the trajectory tracked against them and the global pose.
//! Poses before that keyframe are left untouched.
//!
//! Closures are solved against a snapshot. One solved before another closure
//! was applied no longer describes the map and is refused as stale.

use thiserror::Error;

use super::messages::{LoopCorrectionEvent, VerifiedLoop};
use crate::geometry::SE3;
use crate::keyframe::{GraphError, KeyframeGraph, KeyframeId};

/// Pose of one processed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPose {
    pub timestamp: f64,
    /// `T_world_camera`.
    pub pose: SE3,
    /// Keyframe the frame was tracked against (or promoted to).
    pub keyframe: KeyframeId,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorrectionError {
    #[error("closure was solved after {solved_at} corrections, map has {current}")]
    Stale { solved_at: u64, current: u64 },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, Default)]
pub struct PoseIntegrator {
    global_pose: SE3,
    trajectory: Vec<TrajectoryPose>,
    corrections: u64,
}

impl PoseIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pose(&self) -> SE3 {
        self.global_pose
    }

    pub fn trajectory(&self) -> &[TrajectoryPose] {
        &self.trajectory
    }

    /// Number of loop corrections applied so far.
    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// Compose `relative` (`T_prev_curr`) onto the global pose.
    pub fn advance(&mut self, relative: &SE3) -> SE3 {
        self.global_pose = self.global_pose * *relative;
        self.global_pose
    }

    /// Append the current global pose to the trajectory.
    pub fn record(&mut self, timestamp: f64, keyframe: KeyframeId) {
        self.trajectory.push(TrajectoryPose {
            timestamp,
            pose: self.global_pose,
            keyframe,
        });
    }

    /// Add the loop edge of `closure` to `graph` and re-base every pose the
    /// solver moved.
    ///
    /// The correction of each keyframe is taken relative to the poses the
    /// solver started from, so keyframes promoted while the solver ran follow
    /// the newest corrected keyframe. A closure solved before the latest
    /// applied correction is refused. Nothing is modified on error.
    pub fn apply_loop_correction(
        &mut self,
        graph: &mut KeyframeGraph,
        closure: &VerifiedLoop,
    ) -> Result<LoopCorrectionEvent, CorrectionError> {
        if closure.generation != self.corrections {
            return Err(CorrectionError::Stale {
                solved_at: closure.generation,
                current: self.corrections,
            });
        }
        let solved = closure.corrected.len().min(closure.previous.len());
        if solved > graph.len() {
            return Err(GraphError::UnknownKeyframe(KeyframeId::new(solved as u64 - 1)).into());
        }
        graph.add_loop_edge(
            closure.query,
            closure.candidate,
            closure.transform.inverse(),
            closure.inlier_ratio,
        )?;

        let corrections: Vec<SE3> = (0..solved)
            .map(|i| closure.corrected[i] * closure.previous[i].inverse())
            .collect();
        let first_affected = (0..solved).find(|&i| closure.corrected[i] != closure.previous[i]);

        let mut global_correction = SE3::identity();
        if let Some(first) = first_affected {
            let correction_of = |id: KeyframeId| -> SE3 {
                let i = id.0 as usize;
                corrections[i.min(solved - 1)]
            };

            for i in first..graph.len() {
                let id = KeyframeId::new(i as u64);
                if let Some(kf) = graph.get(id) {
                    let pose = correction_of(id) * kf.pose;
                    graph.set_pose(id, pose)?;
                }
            }

            let first_id = KeyframeId::new(first as u64);
            for entry in self.trajectory.iter_mut().filter(|e| e.keyframe >= first_id) {
                entry.pose = correction_of(entry.keyframe) * entry.pose;
            }

            let latest = self
                .trajectory
                .last()
                .map(|e| e.keyframe)
                .or_else(|| graph.last().map(|kf| kf.id));
            if let Some(latest) = latest.filter(|&id| id >= first_id) {
                global_correction = correction_of(latest);
                self.global_pose = global_correction * self.global_pose;
            }
        }

        self.corrections += 1;
        Ok(LoopCorrectionEvent {
            query: closure.query,
            candidate: closure.candidate,
            first_affected: first_affected.map(|i| KeyframeId::new(i as u64)),
            correction: global_correction,
            inlier_ratio: closure.inlier_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::SharedState;
    use crate::test_support::SyntheticScene;
    use nalgebra::Vector3;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Six keyframes 0.2 m apart with two tracked frames each.
    fn build(integrator: &mut PoseIntegrator, graph: &mut KeyframeGraph) {
        let frame = SyntheticScene::new(1).render(&SE3::identity(), 0.0);
        let half = SE3::from_translation(Vector3::new(0.1, 0.0, 0.0));
        let mut t = 0.0;
        for k in 0..6 {
            let id = graph.push_keyframe(Arc::clone(&frame), integrator.pose(), half * half);
            assert_eq!(id, KeyframeId::new(k));
            integrator.record(t, id);
            integrator.advance(&half);
            t += 0.1;
            integrator.record(t, id);
            integrator.advance(&half);
            t += 0.1;
        }
    }

    fn closure(graph: &KeyframeGraph, shift: SE3, from: usize) -> VerifiedLoop {
        let previous: Vec<SE3> = graph.keyframes().iter().map(|kf| kf.pose).collect();
        let corrected = previous
            .iter()
            .enumerate()
            .map(|(i, p)| if i >= from { shift * *p } else { *p })
            .collect();
        VerifiedLoop {
            query: KeyframeId::new(5),
            candidate: KeyframeId::new(0),
            transform: SE3::identity(),
            inlier_ratio: 0.8,
            previous,
            corrected,
            generation: 0,
        }
    }

    #[test]
    fn test_advance_composes_left_to_right() {
        let mut integrator = PoseIntegrator::new();
        let a = SE3::from_axis_angle(&Vector3::z(), 0.5, Vector3::new(1.0, 0.0, 0.0));
        let b = SE3::from_translation(Vector3::new(0.0, 1.0, 0.0));
        integrator.advance(&a);
        integrator.advance(&b);

        assert!(integrator.pose().approx_eq(&(a * b), 1e-12, 1e-6));
    }

    #[test]
    fn test_correction_rebases_forward_only() {
        let mut integrator = PoseIntegrator::new();
        let mut graph = KeyframeGraph::new();
        build(&mut integrator, &mut graph);
        let before_graph = graph.clone();
        let before = integrator.clone();

        let shift = SE3::from_translation(Vector3::new(0.0, 0.3, 0.0));
        let pending = closure(&graph, shift, 3);
        let event = integrator.apply_loop_correction(&mut graph, &pending).unwrap();

        assert_eq!(event.first_affected, Some(KeyframeId::new(3)));
        for (new, old) in graph.keyframes().iter().zip(before_graph.keyframes()) {
            if new.id < KeyframeId::new(3) {
                assert_eq!(new.pose, old.pose);
            } else {
                assert!(new.pose.approx_eq(&(shift * old.pose), 1e-12, 1e-6));
            }
        }
        for (new, old) in integrator.trajectory().iter().zip(before.trajectory()) {
            if new.keyframe < KeyframeId::new(3) {
                assert_eq!(new.pose, old.pose);
            } else {
                assert!(new.pose.approx_eq(&(shift * old.pose), 1e-12, 1e-6));
            }
        }
        assert!(integrator.pose().approx_eq(&(shift * before.pose()), 1e-12, 1e-6));
        assert_eq!(graph.loop_edges().count(), 1);
        assert_eq!(integrator.corrections(), 1);
    }

    #[test]
    fn test_keyframes_added_during_solve_follow_newest() {
        let mut integrator = PoseIntegrator::new();
        let mut graph = KeyframeGraph::new();
        build(&mut integrator, &mut graph);
        let shift = SE3::from_translation(Vector3::new(0.0, 0.0, -0.2));
        let pending = closure(&graph, shift, 5);

        // A keyframe promoted after the solver's snapshot.
        let frame = Arc::clone(&graph.keyframes()[0].frame);
        let late_pose = integrator.pose();
        let late = graph.push_keyframe(frame, late_pose, SE3::identity());
        integrator.record(9.0, late);

        integrator.apply_loop_correction(&mut graph, &pending).unwrap();

        let moved = graph.get(late).unwrap().pose;
        assert!(moved.approx_eq(&(shift * late_pose), 1e-12, 1e-6));
    }

    #[test]
    fn test_closure_solved_before_last_correction_is_stale() {
        let mut integrator = PoseIntegrator::new();
        let mut graph = KeyframeGraph::new();
        build(&mut integrator, &mut graph);
        let shift = SE3::from_translation(Vector3::new(0.0, -0.1, 0.0));
        // Both solved against the same snapshot.
        let first = closure(&graph, shift, 4);
        let second = closure(&graph, shift, 5);

        integrator.apply_loop_correction(&mut graph, &first).unwrap();
        let after_first = graph.clone();
        let pose = integrator.pose();

        assert_eq!(
            integrator.apply_loop_correction(&mut graph, &second),
            Err(CorrectionError::Stale {
                solved_at: 0,
                current: 1
            })
        );
        for (now, then) in graph.keyframes().iter().zip(after_first.keyframes()) {
            assert_eq!(now.pose, then.pose);
        }
        assert_eq!(integrator.pose(), pose);
        assert_eq!(graph.loop_edges().count(), 1);
        assert_eq!(integrator.corrections(), 1);
    }

    #[test]
    fn test_invalid_closure_changes_nothing() {
        let mut integrator = PoseIntegrator::new();
        let mut graph = KeyframeGraph::new();
        build(&mut integrator, &mut graph);
        let mut bad = closure(&graph, SE3::from_translation(Vector3::x()), 1);
        bad.query = KeyframeId::new(42);
        let before = integrator.pose();

        assert!(integrator.apply_loop_correction(&mut graph, &bad).is_err());
        assert_eq!(integrator.pose(), before);
        assert_eq!(graph.loop_edges().count(), 0);
        assert_eq!(integrator.corrections(), 0);
    }

    #[test]
    fn test_readers_never_observe_partial_correction() {
        let shared = SharedState::new();
        {
            let mut map = shared.map.write();
            let state = &mut *map;
            build(&mut state.integrator, &mut state.graph);
        }
        let shift = SE3::from_translation(Vector3::new(0.0, 1.0, 0.0));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut observed = 0;
                    while !done.load(Ordering::SeqCst) || observed == 0 {
                        let snapshot = shared.snapshot();
                        // Every pose from keyframe 1 on is shifted by 1 m in y, or none is.
                        let shifted: Vec<bool> = snapshot
                            .integrator
                            .trajectory()
                            .iter()
                            .filter(|e| e.keyframe >= KeyframeId::new(1))
                            .map(|e| e.pose.translation.y > 0.5)
                            .chain(
                                snapshot.graph.keyframes()[1..]
                                    .iter()
                                    .map(|kf| kf.pose.translation.y > 0.5),
                            )
                            .chain(std::iter::once(snapshot.integrator.pose().translation.y > 0.5))
                            .collect();
                        assert!(shifted.iter().all(|&s| s == shifted[0]));
                        observed += 1;
                    }
                    observed
                })
            })
            .collect();

        {
            let mut map = shared.map.write();
            let state = &mut *map;
            let pending = closure(&state.graph, shift, 1);
            state
                .integrator
                .apply_loop_correction(&mut state.graph, &pending)
                .unwrap();
        }
        done.store(true, Ordering::SeqCst);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert!(shared.global_pose().translation.y > 0.5);
    }
}
