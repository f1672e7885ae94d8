//! A synchronised color + depth pair with per-keypoint 3D distributions.

use image::RgbImage;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::camera::CameraModel;
use super::depth_model::{DepthImage, DepthModel};
use super::features::{Descriptor, FeatureSet, Keypoint};
use crate::geometry::SE3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Acquisition time in seconds.
    pub timestamp: f64,
    /// Coordinate frame of the camera that produced the images.
    pub frame_id: String,
}

impl FrameHeader {
    pub fn new(timestamp: f64, frame_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            frame_id: frame_id.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("color image is {rgb:?} but depth image is {depth:?}")]
    ImageSizeMismatch { rgb: (u32, u32), depth: (u32, u32) },

    #[error("images are {image:?} but intrinsics describe {camera:?}")]
    CameraSizeMismatch { image: (u32, u32), camera: (u32, u32) },
}

/// One RGB-D observation.
///
/// Keypoints, descriptors, validity flags, means and covariances are parallel
/// arrays. Once features are attached the frame is not modified again.
#[derive(Debug, Clone)]
pub struct RgbdFrame {
    header: FrameHeader,
    camera: CameraModel,
    rgb: RgbImage,
    depth: DepthImage,
    depth_scale: f64,
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor>,
    kp_valid: Vec<bool>,
    kp_means: Vec<Vector3<f64>>,
    kp_covariances: Vec<Matrix3<f64>>,
    n_valid_keypoints: usize,
}

impl RgbdFrame {
    /// Frame without features; `depth_scale` converts raw depth to metres.
    pub fn new(
        header: FrameHeader,
        camera: CameraModel,
        rgb: RgbImage,
        depth: DepthImage,
        depth_scale: f64,
    ) -> Result<Self, FrameError> {
        if rgb.dimensions() != depth.dimensions() {
            return Err(FrameError::ImageSizeMismatch {
                rgb: rgb.dimensions(),
                depth: depth.dimensions(),
            });
        }
        if rgb.dimensions() != (camera.width, camera.height) {
            return Err(FrameError::CameraSizeMismatch {
                image: rgb.dimensions(),
                camera: (camera.width, camera.height),
            });
        }

        Ok(Self {
            header,
            camera,
            rgb,
            depth,
            depth_scale,
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            kp_valid: Vec::new(),
            kp_means: Vec::new(),
            kp_covariances: Vec::new(),
            n_valid_keypoints: 0,
        })
    }

    /// Attach externally detected features and compute each keypoint's 3D
    /// distribution. Invalid keypoints keep a zero mean and covariance.
    pub fn with_features(mut self, features: FeatureSet, model: &DepthModel) -> Self {
        let (keypoints, descriptors) = features.into_parts();

        let mut kp_valid = Vec::with_capacity(keypoints.len());
        let mut kp_means = Vec::with_capacity(keypoints.len());
        let mut kp_covariances = Vec::with_capacity(keypoints.len());

        for kp in &keypoints {
            match model.estimate(
                &self.camera,
                &self.depth,
                self.depth_scale,
                kp.u as f64,
                kp.v as f64,
            ) {
                Some(dist) => {
                    kp_valid.push(true);
                    kp_means.push(dist.mean);
                    kp_covariances.push(dist.covariance);
                }
                None => {
                    kp_valid.push(false);
                    kp_means.push(Vector3::zeros());
                    kp_covariances.push(Matrix3::zeros());
                }
            }
        }

        self.n_valid_keypoints = kp_valid.iter().filter(|&&v| v).count();
        self.keypoints = keypoints;
        self.descriptors = descriptors;
        self.kp_valid = kp_valid;
        self.kp_means = kp_means;
        self.kp_covariances = kp_covariances;
        self
    }

    /// Convenience for building and attaching features in one step.
    pub fn build(
        header: FrameHeader,
        camera: CameraModel,
        rgb: RgbImage,
        depth: DepthImage,
        features: FeatureSet,
        model: &DepthModel,
    ) -> Result<Self, FrameError> {
        Ok(Self::new(header, camera, rgb, depth, model.depth_scale())?.with_features(features, model))
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn timestamp(&self) -> f64 {
        self.header.timestamp
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn depth(&self) -> &DepthImage {
        &self.depth
    }

    pub fn depth_scale(&self) -> f64 {
        self.depth_scale
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn kp_valid(&self) -> &[bool] {
        &self.kp_valid
    }

    pub fn kp_means(&self) -> &[Vector3<f64>] {
        &self.kp_means
    }

    pub fn kp_covariances(&self) -> &[Matrix3<f64>] {
        &self.kp_covariances
    }

    pub fn n_valid_keypoints(&self) -> usize {
        self.n_valid_keypoints
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Indices of keypoints with a valid 3D distribution.
    pub fn valid_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.kp_valid
            .iter()
            .enumerate()
            .filter_map(|(i, &valid)| valid.then_some(i))
    }

    /// Means of valid keypoints, in the camera frame.
    pub fn feature_point_cloud(&self) -> Vec<Vector3<f64>> {
        self.valid_indices().map(|i| self.kp_means[i]).collect()
    }

    /// Means of valid keypoints mapped through `transform` (e.g. the camera pose).
    pub fn transformed_feature_cloud(&self, transform: &SE3) -> Vec<Vector3<f64>> {
        self.valid_indices()
            .map(|i| transform.transform_point(&self.kp_means[i]))
            .collect()
    }

    /// Metric depth at an integer pixel, `None` for missing readings.
    pub fn depth_at(&self, u: u32, v: u32) -> Option<f64> {
        if u >= self.depth.width() || v >= self.depth.height() {
            return None;
        }
        let raw = self.depth.get_pixel(u, v)[0];
        (raw > 0).then(|| raw as f64 * self.depth_scale)
    }
}
