//! Pipeline configuration.
//!
//! Every section carries `#[serde(default)]`, so a YAML file only needs to
//! name the options it overrides. Unknown keys are rejected.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::frame::DepthModelKind;
use crate::keyframe::PromotionPolicy;
use crate::registration::EstimatorKind;
use crate::system::FallbackPolicy;

/// Top-level configuration for [`RgbdOdometry`](crate::system::RgbdOdometry).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OdometryConfig {
    pub depth: DepthConfig,
    pub registration: RegistrationConfig,
    pub keyframes: KeyframeConfig,
    pub loop_closure: LoopClosureConfig,
}

impl OdometryConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("invalid odometry config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&contents).with_context(|| format!("in {}", path.display()))
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.depth.max_range > 0.0, "depth.max_range must be positive");
        ensure!(self.depth.max_stdev > 0.0, "depth.max_stdev must be positive");
        ensure!(self.depth.depth_scale > 0.0, "depth.depth_scale must be positive");
        ensure!(
            self.registration.min_correspondences >= 3,
            "registration.min_correspondences must be at least 3"
        );
        ensure!(
            self.registration.icp.max_iterations > 0,
            "registration.icp.max_iterations must be positive"
        );
        ensure!(
            self.registration.ransac.max_iterations > 0,
            "registration.ransac.max_iterations must be positive"
        );
        ensure!(
            (0.0..1.0).contains(&self.registration.ransac.confidence),
            "registration.ransac.confidence must be in [0, 1)"
        );
        ensure!(
            self.loop_closure.scan_interval > 0,
            "loop_closure.scan_interval must be positive"
        );
        ensure!(
            self.loop_closure.particles.particles > 0,
            "loop_closure.particles.particles must be positive"
        );
        Ok(())
    }
}

/// Depth noise model and keypoint validity thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DepthConfig {
    /// Keypoints further than this (metres) are invalid.
    pub max_range: f64,
    /// Keypoints whose modelled depth stdev exceeds this (metres) are invalid.
    pub max_stdev: f64,
    /// `k` in `σ_z = k·z²`.
    pub stdev_constant: f64,
    /// Keypoint localisation variance in pixels².
    pub pixel_variance: f64,
    /// Metres per raw depth unit.
    pub depth_scale: f64,
    pub model: DepthModelKind,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            max_range: 5.5,
            max_stdev: 0.03,
            stdev_constant: 1.425e-3,
            pixel_variance: 1.0,
            depth_scale: 0.001,
            model: DepthModelKind::Quadratic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrationConfig {
    pub estimator: EstimatorKind,
    /// Fewer surviving correspondences than this fail the estimate.
    pub min_correspondences: usize,
    /// Normal matrices and point scatters above this condition number are degenerate.
    pub max_condition_number: f64,
    pub fallback: FallbackPolicy,
    pub icp: IcpConfig,
    pub ransac: RansacConfig,
    pub model: ModelConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::IcpProbModel,
            min_correspondences: 10,
            max_condition_number: 1e8,
            fallback: FallbackPolicy::ConstantVelocity,
            icp: IcpConfig::default(),
            ransac: RansacConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IcpConfig {
    pub max_iterations: usize,
    /// Stop once the update translation drops below this (metres).
    pub tolerance_translation: f64,
    /// Stop once the update rotation drops below this (radians).
    pub tolerance_rotation: f64,
    /// Euclidean search radius for nearest neighbours (metres).
    pub max_correspondence_distance: f64,
    /// Mahalanobis distance beyond which residuals are down-weighted.
    pub max_mahalanobis_distance: f64,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            tolerance_translation: 1e-4,
            tolerance_rotation: 1e-4,
            max_correspondence_distance: 0.15,
            max_mahalanobis_distance: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RansacConfig {
    pub max_iterations: usize,
    /// Euclidean inlier threshold (metres).
    pub inlier_threshold: f64,
    /// Desired probability of drawing at least one all-inlier sample.
    pub confidence: f64,
    /// Lowe ratio for descriptor matching.
    pub match_ratio: f32,
    pub max_descriptor_distance: f32,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            inlier_threshold: 0.05,
            confidence: 0.99,
            match_ratio: 0.8,
            max_descriptor_distance: 64.0,
            seed: 42,
        }
    }
}

/// Accumulated Gaussian mixture used by the model-based strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub max_size: usize,
    /// Components unseen for more than this many frames are dropped.
    pub max_age: u64,
    /// Components need this many observations before they are matched against.
    pub min_hits: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_size: 3000,
            max_age: 30,
            min_hits: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyframeConfig {
    pub policy: PromotionPolicy,
    /// Translation since the active keyframe that triggers promotion (metres).
    pub max_translation: f64,
    /// Rotation since the active keyframe that triggers promotion (degrees).
    pub max_rotation_deg: f64,
    /// Promote once correspondences fall below this fraction of the keyframe's valid keypoints.
    pub min_correspondence_ratio: f64,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            policy: PromotionPolicy::Displacement,
            max_translation: 0.10,
            max_rotation_deg: 10.0,
            min_correspondence_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopClosureConfig {
    pub enabled: bool,
    /// Scan for loop candidates every this many keyframes.
    pub scan_interval: usize,
    /// Candidate keyframes must lie within this distance (metres).
    pub max_distance: f64,
    /// And within this viewing-angle difference (degrees).
    pub max_angle_deg: f64,
    /// Minimum hop count between candidate and query in the keyframe graph.
    pub min_graph_distance: usize,
    pub max_candidates: usize,
    /// Minimum inlier fraction for a verified closure.
    pub min_inlier_ratio: f64,
    pub particles: ParticleFilterConfig,
}

impl Default for LoopClosureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval: 5,
            max_distance: 1.0,
            max_angle_deg: 45.0,
            min_graph_distance: 10,
            max_candidates: 3,
            min_inlier_ratio: 0.5,
            particles: ParticleFilterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParticleFilterConfig {
    pub particles: usize,
    pub rounds: usize,
    /// Initial translation spread (metres), shrinks each round.
    pub translation_sigma: f64,
    /// Initial rotation spread (degrees), shrinks each round.
    pub rotation_sigma_deg: f64,
    /// Distance under which an aligned point counts as an inlier (metres).
    pub inlier_distance: f64,
    pub seed: u64,
}

impl Default for ParticleFilterConfig {
    fn default() -> Self {
        Self {
            particles: 200,
            rounds: 10,
            translation_sigma: 0.1,
            rotation_sigma_deg: 5.0,
            inlier_distance: 0.05,
            seed: 7,
        }
    }
}
