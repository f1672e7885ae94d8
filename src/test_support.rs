//! Synthetic scenes for unit tests.

use std::sync::Arc;

use image::{Luma, RgbImage};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DepthConfig;
use crate::frame::{
    CameraModel, DepthImage, DepthModel, Descriptor, FeatureSet, FrameHeader, Keypoint, RgbdFrame,
};
use crate::geometry::SE3;

pub const DEPTH_SCALE: f64 = 1e-4;

/// Random points with a minimum spacing inside a box in front of the camera.
pub fn scene_points(n: usize, seed: u64) -> Vec<Vector3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points: Vec<Vector3<f64>> = Vec::with_capacity(n);
    while points.len() < n {
        let p = Vector3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-0.8..0.8),
            rng.gen_range(1.5..3.5),
        );
        if points.iter().all(|q| (q - p).norm() > 0.15) {
            points.push(p);
        }
    }
    points
}

pub fn test_camera() -> CameraModel {
    CameraModel::new(525.0, 525.0, 319.5, 239.5, 640, 480)
}

pub fn depth_model() -> DepthModel {
    DepthModel::new(&DepthConfig {
        depth_scale: DEPTH_SCALE,
        ..DepthConfig::default()
    })
}

/// World landmarks with unique binary descriptors.
pub struct SyntheticScene {
    pub camera: CameraModel,
    pub landmarks: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
}

impl SyntheticScene {
    pub fn new(seed: u64) -> Self {
        Self::with_landmarks(scene_points(250, seed), seed)
    }

    pub fn with_landmarks(landmarks: Vec<Vector3<f64>>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ 0xDE5C);
        let descriptors = landmarks
            .iter()
            .map(|_| Descriptor::Binary((0..32).map(|_| rng.gen()).collect()))
            .collect();
        Self {
            camera: test_camera(),
            landmarks,
            descriptors,
        }
    }

    /// Render the landmarks seen from camera pose `T_wc` as an RGB-D frame.
    pub fn render(&self, pose: &SE3, timestamp: f64) -> Arc<RgbdFrame> {
        let cam = self.camera;
        let to_camera = pose.inverse();
        let mut depth = DepthImage::new(cam.width, cam.height);
        let mut visible = Vec::new();

        for (i, landmark) in self.landmarks.iter().enumerate() {
            let p = to_camera.transform_point(landmark);
            let Some((u, v)) = cam.project(&p) else {
                continue;
            };
            if u < 2.0 || v < 2.0 || u > cam.width as f64 - 3.0 || v > cam.height as f64 - 3.0 {
                continue;
            }
            let raw = (p.z / DEPTH_SCALE).round() as u16;
            let (ui, vi) = (u.round() as u32, v.round() as u32);
            for dv in 0..3 {
                for du in 0..3 {
                    let (x, y) = (ui + du - 1, vi + dv - 1);
                    let current = depth.get_pixel(x, y)[0];
                    if current == 0 || raw < current {
                        depth.put_pixel(x, y, Luma([raw]));
                    }
                }
            }
            visible.push((i, u, v, raw, ui, vi));
        }

        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        for (i, u, v, raw, ui, vi) in visible {
            // Occluded by a nearer landmark.
            if depth.get_pixel(ui, vi)[0] != raw {
                continue;
            }
            keypoints.push(Keypoint::new(u as f32, v as f32));
            descriptors.push(self.descriptors[i].clone());
        }

        let features = FeatureSet::new(keypoints, descriptors).unwrap();
        let frame = RgbdFrame::build(
            FrameHeader::new(timestamp, "camera"),
            cam,
            RgbImage::new(cam.width, cam.height),
            depth,
            features,
            &depth_model(),
        )
        .unwrap();
        Arc::new(frame)
    }
}
