//! Boundary to the pose-graph optimizer.
//!
//! A [`PoseGraphProblem`] is a self-contained copy of the keyframe poses and
//! edges; the solver returns a corrected pose for every node or reports that
//! it found no improvement, in which case the loop edge is discarded. Any
//! optimizer can be plugged in behind [`PoseGraphSolver`].
//! [`RigidRebaseSolver`] is the built-in one: it closes the loop by rigidly
//! moving the newer end of the loop onto the pose implied by the loop edge.

use thiserror::Error;

use crate::geometry::SE3;
use crate::keyframe::{EdgeKind, GraphEdge, KeyframeGraph, KeyframeId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("no improvement found")]
    NoImprovement,

    #[error("edge refers to unknown keyframe {0}")]
    MissingNode(KeyframeId),
}

#[derive(Debug, Clone)]
pub struct PoseGraphProblem {
    /// Node poses indexed by keyframe id.
    pub poses: Vec<SE3>,
    pub edges: Vec<GraphEdge>,
}

impl PoseGraphProblem {
    pub fn from_graph(graph: &KeyframeGraph) -> Self {
        Self {
            poses: graph.keyframes().iter().map(|kf| kf.pose).collect(),
            edges: graph.edges().to_vec(),
        }
    }

    pub fn pose(&self, id: KeyframeId) -> Result<&SE3, SolverError> {
        self.poses
            .get(id.0 as usize)
            .ok_or(SolverError::MissingNode(id))
    }

    /// Residual of an edge: identity when the node poses satisfy it exactly.
    pub fn residual(&self, edge: &GraphEdge) -> Result<SE3, SolverError> {
        let source = self.pose(edge.source)?;
        let target = self.pose(edge.target)?;
        Ok(edge.transform.inverse() * source.between(target))
    }
}

pub trait PoseGraphSolver: Send {
    /// Corrected pose for every node of `problem`, in node order.
    fn optimize(&mut self, problem: &PoseGraphProblem) -> Result<Vec<SE3>, SolverError>;
}

/// Closes the most recent loop edge by rigidly re-basing every keyframe from
/// the loop's newer end onward.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigidRebaseSolver;

impl PoseGraphSolver for RigidRebaseSolver {
    fn optimize(&mut self, problem: &PoseGraphProblem) -> Result<Vec<SE3>, SolverError> {
        let edge = problem
            .edges
            .iter()
            .rev()
            .find(|e| e.kind == EdgeKind::Loop)
            .ok_or(SolverError::NoImprovement)?;

        let newer = edge.source.max(edge.target);
        let older = edge.source.min(edge.target);
        let older_pose = problem.pose(older)?;
        let newer_pose = problem.pose(newer)?;

        // T_older_newer as measured by the loop edge.
        let measured = if edge.source == newer {
            edge.transform.inverse()
        } else {
            edge.transform
        };
        let expected = older_pose * &measured;
        let correction = expected * newer_pose.inverse();

        Ok(problem
            .poses
            .iter()
            .enumerate()
            .map(|(i, pose)| {
                if i >= newer.0 as usize {
                    correction * *pose
                } else {
                    *pose
                }
            })
            .collect())
    }
}
