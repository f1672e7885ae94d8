//! Correspondence search: geometric (k-d tree) and descriptor based.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Vector3;
use rayon::prelude::*;

use crate::frame::Descriptor;
use crate::geometry::SE3;

/// A source/target index pair with its distance (metres or descriptor units).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub source: usize,
    pub target: usize,
    pub distance: f64,
}

/// k-d tree over 3D points, returning indices into the original slice.
pub struct PointIndex {
    tree: KdTree<f64, 3>,
    len: usize,
}

impl PointIndex {
    pub fn new(points: &[Vector3<f64>]) -> Self {
        let mut tree: KdTree<f64, 3> = KdTree::with_capacity(points.len().max(1));
        for (i, p) in points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }
        Self {
            tree,
            len: points.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Nearest point and its Euclidean distance.
    pub fn nearest(&self, query: &Vector3<f64>) -> Option<(usize, f64)> {
        if self.is_empty() {
            return None;
        }
        let nn = self
            .tree
            .nearest_one::<SquaredEuclidean>(&[query.x, query.y, query.z]);
        Some((nn.item as usize, nn.distance.sqrt()))
    }

    /// Up to `k` nearest points sorted by increasing Euclidean distance.
    pub fn nearest_n(&self, query: &Vector3<f64>, k: usize) -> Vec<(usize, f64)> {
        if self.is_empty() || k == 0 {
            return Vec::new();
        }
        self.tree
            .nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k.min(self.len))
            .into_iter()
            .map(|nn| (nn.item as usize, nn.distance.sqrt()))
            .collect()
    }
}

/// Nearest target for every transformed source point within `max_distance`.
pub fn nearest_neighbors(
    source: &[Vector3<f64>],
    transform: &SE3,
    index: &PointIndex,
    max_distance: f64,
) -> Vec<Correspondence> {
    source
        .par_iter()
        .enumerate()
        .filter_map(|(i, p)| {
            let q = transform.transform_point(p);
            let (target, distance) = index.nearest(&q)?;
            (distance <= max_distance).then_some(Correspondence {
                source: i,
                target,
                distance,
            })
        })
        .collect()
}

/// Best and second best target for one source descriptor.
fn best_two(query: &Descriptor, targets: &[&Descriptor]) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32)> = None;
    let mut second = f32::INFINITY;
    for (j, t) in targets.iter().enumerate() {
        let Some(d) = query.distance(t) else {
            continue;
        };
        match best {
            Some((_, bd)) if d >= bd => second = second.min(d),
            Some((_, bd)) => {
                second = bd;
                best = Some((j, d));
            }
            None => best = Some((j, d)),
        }
    }
    best.map(|(j, d)| (j, d, second))
}

/// Brute-force descriptor matching with Lowe's ratio test and a mutual
/// consistency check.
///
/// A pair `(i, j)` is kept when `j` is the best target for `i`, `i` is the
/// best source for `j`, the distance does not exceed `max_distance`, and the
/// best distance is below `ratio` times the second best.
pub fn match_descriptors(
    source: &[&Descriptor],
    target: &[&Descriptor],
    ratio: f32,
    max_distance: f32,
) -> Vec<Correspondence> {
    if source.is_empty() || target.is_empty() {
        return Vec::new();
    }

    let forward: Vec<Option<(usize, f32, f32)>> =
        source.par_iter().map(|d| best_two(d, target)).collect();
    let backward: Vec<Option<(usize, f32, f32)>> =
        target.par_iter().map(|d| best_two(d, source)).collect();

    forward
        .iter()
        .enumerate()
        .filter_map(|(i, m)| {
            let (j, d, second) = (*m)?;
            if d > max_distance {
                return None;
            }
            if second.is_finite() && d >= ratio * second {
                return None;
            }
            match backward[j] {
                Some((back, _, _)) if back == i => Some(Correspondence {
                    source: i,
                    target: j,
                    distance: d as f64,
                }),
                _ => None,
            }
        })
        .collect()
}
