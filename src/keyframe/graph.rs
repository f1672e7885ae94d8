//! Keyframe arena and the edge list between keyframes.
//!
//! Keyframes are stored in creation order and addressed by [`KeyframeId`],
//! which is also their arena index. Edges are plain `(source, target)` id
//! pairs, so loop edges may point backwards in creation order without any
//! shared ownership between keyframes.

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use super::types::KeyframeId;
use crate::frame::RgbdFrame;
use crate::geometry::SE3;

/// A retained frame anchored at a global pose.
#[derive(Debug, Clone)]
pub struct Keyframe {
    pub id: KeyframeId,
    pub frame: Arc<RgbdFrame>,
    /// `T_world_keyframe`.
    pub pose: SE3,
}

impl Keyframe {
    pub fn timestamp(&self) -> f64 {
        self.frame.timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Between consecutive keyframes, from the older to the newer.
    Sequential,
    /// Between non-consecutive keyframes, from the newer to the older.
    Loop,
}

/// Relative pose constraint between two keyframes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphEdge {
    pub source: KeyframeId,
    pub target: KeyframeId,
    /// `T_source_target`.
    pub transform: SE3,
    pub weight: f64,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("unknown keyframe {0}")]
    UnknownKeyframe(KeyframeId),

    #[error("loop edge must join two distinct keyframes, got {0} twice")]
    SelfLoop(KeyframeId),
}

#[derive(Debug, Clone, Default)]
pub struct KeyframeGraph {
    keyframes: Vec<Keyframe>,
    edges: Vec<GraphEdge>,
}

impl KeyframeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn get(&self, id: KeyframeId) -> Option<&Keyframe> {
        self.keyframes.get(id.index())
    }

    pub fn last(&self) -> Option<&Keyframe> {
        self.keyframes.last()
    }

    pub fn contains(&self, id: KeyframeId) -> bool {
        id.index() < self.keyframes.len()
    }

    pub fn loop_edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter().filter(|e| e.kind == EdgeKind::Loop)
    }

    /// Append a keyframe at `pose`.
    ///
    /// Unless this is the first keyframe, a sequential edge from the previous
    /// keyframe carrying `relative` (`T_previous_new`) is added as well.
    pub fn push_keyframe(&mut self, frame: Arc<RgbdFrame>, pose: SE3, relative: SE3) -> KeyframeId {
        let id = KeyframeId::new(self.keyframes.len() as u64);
        if let Some(previous) = self.keyframes.last() {
            self.edges.push(GraphEdge {
                source: previous.id,
                target: id,
                transform: relative,
                weight: 1.0,
                kind: EdgeKind::Sequential,
            });
        }
        self.keyframes.push(Keyframe { id, frame, pose });
        id
    }

    /// Add a loop constraint `T_source_target` between two existing keyframes.
    pub fn add_loop_edge(
        &mut self,
        source: KeyframeId,
        target: KeyframeId,
        transform: SE3,
        weight: f64,
    ) -> Result<(), GraphError> {
        for id in [source, target] {
            if !self.contains(id) {
                return Err(GraphError::UnknownKeyframe(id));
            }
        }
        if source == target {
            return Err(GraphError::SelfLoop(source));
        }
        self.edges.push(GraphEdge {
            source,
            target,
            transform,
            weight,
            kind: EdgeKind::Loop,
        });
        Ok(())
    }

    pub fn set_pose(&mut self, id: KeyframeId, pose: SE3) -> Result<(), GraphError> {
        let keyframe = self
            .keyframes
            .get_mut(id.index())
            .ok_or(GraphError::UnknownKeyframe(id))?;
        keyframe.pose = pose;
        Ok(())
    }

    /// Fewest edges between two keyframes, ignoring direction.
    pub fn graph_distance(&self, from: KeyframeId, to: KeyframeId) -> Option<usize> {
        if !self.contains(to) {
            return None;
        }
        self.hop_distances(from).get(to.index()).copied().flatten()
    }

    /// Fewest edges from `from` to every keyframe, indexed by keyframe id.
    /// Unreachable keyframes are `None`; all are `None` for an unknown `from`.
    pub fn hop_distances(&self, from: KeyframeId) -> Vec<Option<usize>> {
        let mut depth = vec![None; self.keyframes.len()];
        if !self.contains(from) {
            return depth;
        }

        let mut adjacency = vec![Vec::new(); self.keyframes.len()];
        for edge in &self.edges {
            adjacency[edge.source.index()].push(edge.target);
            adjacency[edge.target.index()].push(edge.source);
        }

        depth[from.index()] = Some(0);
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            let Some(d) = depth[id.index()] else {
                continue;
            };
            for &next in &adjacency[id.index()] {
                if depth[next.index()].is_none() {
                    depth[next.index()] = Some(d + 1);
                    queue.push_back(next);
                }
            }
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SyntheticScene;
    use nalgebra::Vector3;

    fn chain(n: usize) -> KeyframeGraph {
        let frame = SyntheticScene::new(1).render(&SE3::identity(), 0.0);
        let step = SE3::from_translation(Vector3::new(0.1, 0.0, 0.0));
        let mut graph = KeyframeGraph::new();
        let mut pose = SE3::identity();
        for _ in 0..n {
            graph.push_keyframe(Arc::clone(&frame), pose, step);
            pose = pose * step;
        }
        graph
    }

    #[test]
    fn test_sequential_edges() {
        let graph = chain(4);

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.edges().len(), 3);
        // Every keyframe but the first has an incoming sequential edge.
        for kf in &graph.keyframes()[1..] {
            assert!(graph
                .edges()
                .iter()
                .any(|e| e.target == kf.id && e.kind == EdgeKind::Sequential));
        }
    }

    #[test]
    fn test_loop_edge_shortens_distance() {
        let mut graph = chain(12);
        let (first, last) = (KeyframeId::new(0), KeyframeId::new(11));
        assert_eq!(graph.graph_distance(first, last), Some(11));

        graph
            .add_loop_edge(last, first, SE3::identity(), 0.9)
            .unwrap();

        assert_eq!(graph.graph_distance(first, last), Some(1));
        assert_eq!(graph.loop_edges().count(), 1);
        // Sequential edges are untouched.
        assert_eq!(graph.edges().len(), 12);
    }

    #[test]
    fn test_loop_edge_validation() {
        let mut graph = chain(2);

        assert_eq!(
            graph.add_loop_edge(KeyframeId::new(1), KeyframeId::new(5), SE3::identity(), 1.0),
            Err(GraphError::UnknownKeyframe(KeyframeId::new(5)))
        );
        assert_eq!(
            graph.add_loop_edge(KeyframeId::new(1), KeyframeId::new(1), SE3::identity(), 1.0),
            Err(GraphError::SelfLoop(KeyframeId::new(1)))
        );
    }

    #[test]
    fn test_graph_distance_unknown() {
        let graph = chain(2);
        assert_eq!(graph.graph_distance(KeyframeId::new(0), KeyframeId::new(9)), None);
        assert_eq!(graph.graph_distance(KeyframeId::new(1), KeyframeId::new(1)), Some(0));
        assert_eq!(graph.hop_distances(KeyframeId::new(7)), vec![None, None]);
    }

    #[test]
    fn test_hop_distances_follow_loop_edge() {
        let mut graph = chain(10);
        graph
            .add_loop_edge(KeyframeId::new(9), KeyframeId::new(0), SE3::identity(), 1.0)
            .unwrap();

        let hops = graph.hop_distances(KeyframeId::new(9));
        assert_eq!(hops.len(), 10);
        assert_eq!(hops[9], Some(0));
        assert_eq!(hops[0], Some(1));
        assert_eq!(hops[4], Some(5));
        assert_eq!(hops[5], Some(4));
        for (i, d) in hops.iter().enumerate() {
            assert_eq!(*d, graph.graph_distance(KeyframeId::new(9), KeyframeId::new(i as u64)));
        }
    }
}
