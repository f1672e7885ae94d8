//! Loop candidate search over the keyframe graph.
//!
//! A candidate is an older keyframe whose estimated pose is close to the
//! query keyframe in space and viewing direction, yet many hops away in the
//! graph. Pairs already joined by a loop edge are one hop apart and therefore
//! never proposed again.

use crate::config::LoopClosureConfig;
use crate::keyframe::{KeyframeGraph, KeyframeId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopCandidate {
    /// The keyframe that triggered the scan.
    pub query: KeyframeId,
    /// The older keyframe it may be closing back to.
    pub candidate: KeyframeId,
    /// Euclidean distance between the two keyframe positions.
    pub distance: f64,
    /// Relative rotation angle between the two keyframes (radians).
    pub angle: f64,
    /// Hops between the two in the graph, `None` when disconnected.
    pub graph_distance: Option<usize>,
}

/// Candidates for `query`, nearest first, at most `max_candidates`.
pub fn find_candidates(
    graph: &KeyframeGraph,
    query: KeyframeId,
    config: &LoopClosureConfig,
) -> Vec<LoopCandidate> {
    let Some(query_kf) = graph.get(query) else {
        return Vec::new();
    };
    let max_angle = config.max_angle_deg.to_radians();
    let hops = graph.hop_distances(query);

    let mut candidates: Vec<LoopCandidate> = graph
        .keyframes()
        .iter()
        .filter(|kf| kf.id < query)
        .filter_map(|kf| {
            let relative = kf.pose.between(&query_kf.pose);
            let distance = relative.translation_norm();
            let angle = relative.rotation_angle();
            if distance > config.max_distance || angle > max_angle {
                return None;
            }

            let graph_distance = hops[kf.id.index()];
            if graph_distance.is_some_and(|d| d < config.min_graph_distance) {
                return None;
            }

            Some(LoopCandidate {
                query,
                candidate: kf.id,
                distance,
                angle,
                graph_distance,
            })
        })
        .collect();

    candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    candidates.truncate(config.max_candidates);
    candidates
}
