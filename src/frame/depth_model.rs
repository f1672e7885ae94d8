//! Per-pixel depth uncertainty.
//!
//! Structured-light depth noise grows quadratically with range:
//!
//! ```text
//! σ_z = k · z²
//! ```
//!
//! Back-projecting `(u, v, z)` through the pinhole model and propagating
//! `σ_z` together with a fixed pixel localisation variance gives a full 3×3
//! covariance for each keypoint. The mixture variant blends a 3×3
//! neighbourhood of depth readings, weighted by pixel proximity and depth
//! agreement, to smooth quantisation artefacts.

use image::{ImageBuffer, Luma};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::camera::CameraModel;
use crate::config::DepthConfig;

/// Raw 16-bit depth image, zero meaning "no reading".
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Proximity weights of the 3×3 mixture kernel.
const MIXTURE_KERNEL: [[f64; 3]; 3] = [[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthModelKind {
    #[default]
    Quadratic,
    Mixture,
}

/// A 3D Gaussian in the camera frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointDistribution {
    pub mean: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthModel {
    kind: DepthModelKind,
    max_range: f64,
    max_stdev: f64,
    stdev_constant: f64,
    pixel_variance: f64,
    depth_scale: f64,
}

impl DepthModel {
    pub fn new(config: &DepthConfig) -> Self {
        Self {
            kind: config.model,
            max_range: config.max_range,
            max_stdev: config.max_stdev,
            stdev_constant: config.stdev_constant,
            pixel_variance: config.pixel_variance,
            depth_scale: config.depth_scale,
        }
    }

    pub fn kind(&self) -> DepthModelKind {
        self.kind
    }

    /// Default metres per raw unit for frames built with this model.
    pub fn depth_scale(&self) -> f64 {
        self.depth_scale
    }

    /// Depth standard deviation at range `z`.
    #[inline]
    pub fn depth_stdev(&self, z: f64) -> f64 {
        self.stdev_constant * z * z
    }

    #[inline]
    pub fn depth_variance(&self, z: f64) -> f64 {
        let s = self.depth_stdev(z);
        s * s
    }

    /// Validity test applied to every keypoint: present, in range, not too noisy.
    pub fn is_valid(&self, z: f64, stdev: f64) -> bool {
        z.is_finite() && z > 0.0 && z <= self.max_range && stdev <= self.max_stdev
    }

    /// Quadratic model at `(u, v)` with metric depth `z`; `None` when invalid.
    pub fn quadratic(
        &self,
        camera: &CameraModel,
        u: f64,
        v: f64,
        z: f64,
    ) -> Option<PointDistribution> {
        let var_z = self.depth_variance(z);
        if !self.is_valid(z, var_z.sqrt()) {
            return None;
        }
        Some(self.distribution(camera, u, v, z, var_z))
    }

    /// Estimate the keypoint distribution at sub-pixel `(u, v)` from a raw
    /// depth image with `depth_scale` metres per unit.
    pub fn estimate(
        &self,
        camera: &CameraModel,
        depth: &DepthImage,
        depth_scale: f64,
        u: f64,
        v: f64,
    ) -> Option<PointDistribution> {
        let (ui, vi) = pixel_index(depth, u, v)?;
        let z = raw_to_metric(depth.get_pixel(ui, vi)[0], depth_scale)?;

        match self.kind {
            DepthModelKind::Quadratic => self.quadratic(camera, u, v, z),
            DepthModelKind::Mixture => match self.mixture_depth(depth, depth_scale, ui, vi, z) {
                Some((mean_z, var_z)) => {
                    if !self.is_valid(mean_z, var_z.sqrt()) {
                        return None;
                    }
                    Some(self.distribution(camera, u, v, mean_z, var_z))
                }
                None => self.quadratic(camera, u, v, z),
            },
        }
    }

    /// Mixture of the 3×3 neighbourhood around `(ui, vi)`.
    ///
    /// Returns `None` at image borders or when any neighbour is invalid, in
    /// which case the caller falls back to the quadratic model.
    fn mixture_depth(
        &self,
        depth: &DepthImage,
        depth_scale: f64,
        ui: u32,
        vi: u32,
        z_center: f64,
    ) -> Option<(f64, f64)> {
        if ui == 0 || vi == 0 || ui + 1 >= depth.width() || vi + 1 >= depth.height() {
            return None;
        }

        let sigma_center = self.depth_stdev(z_center);
        let mut weight_sum = 0.0;
        let mut mean_acc = 0.0;
        let mut second_moment_acc = 0.0;

        for (dy, row) in MIXTURE_KERNEL.iter().enumerate() {
            for (dx, proximity) in row.iter().enumerate() {
                let raw = depth.get_pixel(ui + dx as u32 - 1, vi + dy as u32 - 1)[0];
                let z = raw_to_metric(raw, depth_scale)?;
                let var = self.depth_variance(z);
                if !self.is_valid(z, var.sqrt()) {
                    return None;
                }

                let agreement = (z - z_center) / sigma_center;
                let w = proximity * (-0.5 * agreement * agreement).exp();
                weight_sum += w;
                mean_acc += w * z;
                second_moment_acc += w * (var + z * z);
            }
        }

        let mean = mean_acc / weight_sum;
        let variance = (second_moment_acc / weight_sum - mean * mean).max(0.0);
        Some((mean, variance))
    }

    /// Propagate pixel and depth variance through the back-projection.
    fn distribution(&self, camera: &CameraModel, u: f64, v: f64, z: f64, var_z: f64) -> PointDistribution {
        let uc = u - camera.cx;
        let vc = v - camera.cy;
        let var_px = self.pixel_variance;
        let (fx, fy) = (camera.fx, camera.fy);

        let sxx = ((z * z + var_z) * var_px + uc * uc * var_z) / (fx * fx);
        let syy = ((z * z + var_z) * var_px + vc * vc * var_z) / (fy * fy);
        let sxy = uc * vc * var_z / (fx * fy);
        let sxz = uc * var_z / fx;
        let syz = vc * var_z / fy;

        #[rustfmt::skip]
        let covariance = Matrix3::new(
            sxx, sxy, sxz,
            sxy, syy, syz,
            sxz, syz, var_z,
        );

        PointDistribution {
            mean: camera.back_project(u, v, z),
            covariance,
        }
    }
}

impl Default for DepthModel {
    fn default() -> Self {
        Self::new(&DepthConfig::default())
    }
}

fn raw_to_metric(raw: u16, depth_scale: f64) -> Option<f64> {
    if raw == 0 {
        return None;
    }
    Some(raw as f64 * depth_scale)
}

/// Nearest integer pixel for sub-pixel `(u, v)`, `None` outside the image.
///
/// Bounds match [`CameraModel::contains`]; coordinates in the last half
/// pixel round onto the edge column or row.
fn pixel_index(depth: &DepthImage, u: f64, v: f64) -> Option<(u32, u32)> {
    let (width, height) = (depth.width(), depth.height());
    if width == 0 || height == 0 {
        return None;
    }
    if !(u >= 0.0 && v >= 0.0 && u < width as f64 && v < height as f64) {
        return None;
    }
    let ui = (u.round() as u32).min(width - 1);
    let vi = (v.round() as u32).min(height - 1);
    Some((ui, vi))
}
