//! Keypoints and descriptors supplied by an external detector.
//!
//! Detection itself lives outside this crate. A [`FeatureSource`] hands over a
//! [`FeatureSet`] per color image; descriptors may be binary (ORB-like,
//! compared by Hamming distance) or float (SURF/SIFT-like, compared by L2).

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 2D keypoint in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub u: f32,
    pub v: f32,
}

impl Keypoint {
    pub fn new(u: f32, v: f32) -> Self {
        Self { u, v }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum Descriptor {
    Binary(Vec<u8>),
    Float(Vec<f32>),
}

impl Descriptor {
    /// Hamming distance for binary descriptors, L2 for float descriptors.
    ///
    /// `None` when the descriptors differ in kind or length.
    pub fn distance(&self, other: &Descriptor) -> Option<f32> {
        match (self, other) {
            (Descriptor::Binary(a), Descriptor::Binary(b)) if a.len() == b.len() => Some(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| (x ^ y).count_ones())
                    .sum::<u32>() as f32,
            ),
            (Descriptor::Float(a), Descriptor::Float(b)) if a.len() == b.len() => Some(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt(),
            ),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Descriptor::Binary(d) => d.len(),
            Descriptor::Float(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("{keypoints} keypoints but {descriptors} descriptors")]
    LengthMismatch { keypoints: usize, descriptors: usize },
}

/// Keypoints with parallel descriptors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Vec<Descriptor>) -> Result<Self, FeatureError> {
        if keypoints.len() != descriptors.len() {
            return Err(FeatureError::LengthMismatch {
                keypoints: keypoints.len(),
                descriptors: descriptors.len(),
            });
        }
        Ok(Self {
            keypoints,
            descriptors,
        })
    }

    /// Load a feature set stored as YAML next to a persisted frame.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read features {}", path.display()))?;
        let parsed: FeatureSet = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse features {}", path.display()))?;
        Ok(Self::new(parsed.keypoints, parsed.descriptors)?)
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Keypoint>, Vec<Descriptor>) {
        (self.keypoints, self.descriptors)
    }
}

/// External keypoint detector and descriptor extractor.
pub trait FeatureSource: Send {
    fn detect(&mut self, rgb: &RgbImage) -> Result<FeatureSet>;
}

/// Replays precomputed feature sets in order, ignoring the image.
#[derive(Debug, Default)]
pub struct QueuedFeatures {
    queue: VecDeque<FeatureSet>,
}

impl QueuedFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, features: FeatureSet) {
        self.queue.push_back(features);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl FeatureSource for QueuedFeatures {
    fn detect(&mut self, _rgb: &RgbImage) -> Result<FeatureSet> {
        self.queue
            .pop_front()
            .ok_or_else(|| anyhow!("no queued features left"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hamming_distance() {
        let a = Descriptor::Binary(vec![0b1010_1010, 0xFF]);
        let b = Descriptor::Binary(vec![0b0101_0101, 0xFF]);
        assert_eq!(a.distance(&b), Some(8.0));
        assert_eq!(a.distance(&a), Some(0.0));
    }

    #[test]
    fn test_l2_distance() {
        let a = Descriptor::Float(vec![0.0, 3.0]);
        let b = Descriptor::Float(vec![4.0, 0.0]);
        assert_eq!(a.distance(&b), Some(5.0));
    }

    #[test]
    fn test_mixed_kinds_never_match() {
        let a = Descriptor::Binary(vec![0; 4]);
        let b = Descriptor::Float(vec![0.0; 4]);
        let c = Descriptor::Binary(vec![0; 8]);
        assert_eq!(a.distance(&b), None);
        assert_eq!(a.distance(&c), None);
    }

    #[test]
    fn test_feature_set_length_check() {
        let err = FeatureSet::new(vec![Keypoint::new(1.0, 2.0)], vec![]).unwrap_err();
        assert_eq!(
            err,
            FeatureError::LengthMismatch {
                keypoints: 1,
                descriptors: 0
            }
        );
    }

    #[test]
    fn test_feature_set_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
keypoints:
  - {{u: 10.5, v: 20.0}}
  - {{u: 30.0, v: 40.25}}
descriptors:
  - {{kind: binary, values: [1, 2, 3]}}
  - {{kind: binary, values: [4, 5, 6]}}
"#
        )
        .unwrap();

        let set = FeatureSet::from_yaml_file(file.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.keypoints()[1], Keypoint::new(30.0, 40.25));
        assert_eq!(set.descriptors()[0], Descriptor::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn test_feature_set_yaml_rejects_mismatch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "keypoints:\n  - {{u: 1.0, v: 1.0}}\ndescriptors: []\n").unwrap();
        assert!(FeatureSet::from_yaml_file(file.path()).is_err());
    }

    #[test]
    fn test_queued_features() {
        let mut queue = QueuedFeatures::new();
        queue.push(FeatureSet::default());
        let image = RgbImage::new(4, 4);

        assert!(queue.detect(&image).is_ok());
        assert!(queue.detect(&image).is_err());
    }
}
