//! End-to-end runs of the odometry pipeline on rendered scenes.

use std::sync::Arc;
use std::time::Duration;

use image::{Luma, RgbImage};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rust_rgbd::config::{DepthConfig, OdometryConfig};
use rust_rgbd::frame::{
    load_frame, save_frame, CameraModel, DepthImage, DepthModel, Descriptor, FeatureSet,
    FrameHeader, Keypoint, RgbdFrame,
};
use rust_rgbd::geometry::SE3;
use rust_rgbd::registration::EstimatorKind;
use rust_rgbd::system::{FrameStatus, RgbdOdometry};

const DEPTH_SCALE: f64 = 1e-4;

struct Scene {
    camera: CameraModel,
    landmarks: Vec<Vector3<f64>>,
    descriptors: Vec<Descriptor>,
}

impl Scene {
    fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut landmarks: Vec<Vector3<f64>> = Vec::new();
        while landmarks.len() < 300 {
            let p = Vector3::new(
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-0.8..0.8),
                rng.gen_range(1.5..3.5),
            );
            if landmarks.iter().all(|q| (q - p).norm() > 0.15) {
                landmarks.push(p);
            }
        }
        let descriptors = landmarks
            .iter()
            .map(|_| Descriptor::Binary((0..32).map(|_| rng.gen()).collect()))
            .collect();
        Self {
            camera: CameraModel::new(525.0, 525.0, 319.5, 239.5, 640, 480),
            landmarks,
            descriptors,
        }
    }

    /// Frame without features plus the features an external detector would report.
    fn render(&self, pose: &SE3, timestamp: f64) -> (RgbdFrame, FeatureSet) {
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
            if depth.get_pixel(ui, vi)[0] != raw {
                continue;
            }
            keypoints.push(Keypoint::new(u as f32, v as f32));
            descriptors.push(self.descriptors[i].clone());
        }

        let frame = RgbdFrame::new(
            FrameHeader::new(timestamp, "camera"),
            cam,
            RgbImage::new(cam.width, cam.height),
            depth,
            DEPTH_SCALE,
        )
        .unwrap();
        (frame, FeatureSet::new(keypoints, descriptors).unwrap())
    }
}

fn config() -> OdometryConfig {
    let mut config = OdometryConfig {
        depth: DepthConfig {
            depth_scale: DEPTH_SCALE,
            ..DepthConfig::default()
        },
        ..OdometryConfig::default()
    };
    config.loop_closure.scan_interval = 1;
    config.loop_closure.min_graph_distance = 4;
    config
}

/// 2 cm steps along x: out for `half` frames, then back.
fn out_and_back(i: usize, half: usize) -> SE3 {
    let k = if i <= half { i } else { 2 * half - i };
    SE3::from_translation(Vector3::new(0.02 * k as f64, 0.0, 0.0))
}

#[test]
fn out_and_back_closes_a_loop() {
    let scene = Scene::new(11);
    let config = config();
    let depth_model = DepthModel::new(&config.depth);
    let mut odometry = RgbdOdometry::new(config).unwrap();

    let half = 30;
    for i in 0..=2 * half {
        let (frame, features) = scene.render(&out_and_back(i, half), i as f64 / 30.0);
        let frame = frame.with_features(features, &depth_model);
        let outcome = odometry.process_frame(Arc::new(frame));
        if i > 0 {
            assert!(outcome.is_tracked(), "frame {i}: {:?}", outcome.status);
        }
    }
    odometry.flush_loop_closure(Duration::from_secs(120));

    let snapshot = odometry.snapshot();
    assert!(snapshot.graph.len() >= 8);
    assert!(snapshot.graph.loop_edges().count() >= 1);
    assert!(snapshot.integrator.corrections() >= 1);
    assert_eq!(snapshot.integrator.trajectory().len(), 2 * half + 1);
    assert!(snapshot.integrator.pose().approx_eq(&SE3::identity(), 3e-2, 3e-2));

    // Loop edges always join keyframes far apart in the sequential chain.
    for edge in snapshot.graph.loop_edges() {
        let hops = edge.source.0.abs_diff(edge.target.0);
        assert!(hops >= 4, "loop edge spans {hops} keyframes");
    }

    odometry.shutdown();
}

/// Slow wander with a little rotation, staying inside the rendered scene.
fn wander(i: usize) -> SE3 {
    let t = i as f64;
    SE3::from_axis_angle(
        &Vector3::new(0.2, 1.0, 0.1),
        0.04 * (0.05 * t).sin(),
        Vector3::new(
            0.15 * (0.04 * t).sin(),
            0.03 * (0.09 * t).sin(),
            0.1 * (0.03 * t).sin(),
        ),
    )
}

#[test]
fn long_runs_keep_tracking_with_unit_rotations() {
    let scene = Scene::new(17);
    for kind in [EstimatorKind::IcpProbModel, EstimatorKind::RansacModel] {
        let mut config = config();
        config.loop_closure.enabled = false;
        config.registration.estimator = kind;
        let depth_model = DepthModel::new(&config.depth);
        let mut odometry = RgbdOdometry::new(config).unwrap();

        for i in 0..120 {
            let (frame, features) = scene.render(&wander(i), i as f64 / 30.0);
            let outcome =
                odometry.process_frame(Arc::new(frame.with_features(features, &depth_model)));
            if i > 0 {
                assert!(outcome.is_tracked(), "{kind:?} frame {i}: {:?}", outcome.status);
            }
            assert!((outcome.relative.rotation.norm() - 1.0).abs() < 1e-9);
            assert!((outcome.pose.rotation.norm() - 1.0).abs() < 1e-9);
        }

        assert!(
            odometry.pose().approx_eq(&wander(119), 5e-2, 5e-2),
            "{kind:?} ended at {}",
            odometry.pose()
        );
        odometry.shutdown();
    }
}

#[test]
fn replay_from_disk_matches_live_run() {
    let scene = Scene::new(5);
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.loop_closure.enabled = false;
    config.registration.estimator = EstimatorKind::RansacModel;
    let depth_model = DepthModel::new(&config.depth);

    let poses: Vec<SE3> = (0..5)
        .map(|i| {
            SE3::from_axis_angle(
                &Vector3::y(),
                0.01 * i as f64,
                Vector3::new(0.015 * i as f64, 0.005 * i as f64, 0.0),
            )
        })
        .collect();

    let mut live = RgbdOdometry::new(config.clone()).unwrap();
    let mut replay = RgbdOdometry::new(config).unwrap();

    for (i, pose) in poses.iter().enumerate() {
        let (frame, features) = scene.render(pose, i as f64 * 0.1);
        let frame_dir = dir.path().join(format!("{i:04}"));
        save_frame(&frame, &frame_dir).unwrap();

        let loaded = load_frame(&frame_dir).unwrap();
        assert_eq!(loaded.timestamp(), frame.timestamp());
        assert_eq!(loaded.depth(), frame.depth());

        let a = live.process_frame(Arc::new(frame.with_features(features.clone(), &depth_model)));
        let b = replay.process_frame(Arc::new(loaded.with_features(features, &depth_model)));
        assert_eq!(a.status, b.status);
        assert_eq!(a.pose, b.pose);
    }

    assert!(replay.pose().approx_eq(&poses[4], 1e-2, 1e-2));
    live.shutdown();
    replay.shutdown();
}

#[test]
fn a_bad_frame_does_not_stop_the_pipeline() {
    let scene = Scene::new(2);
    let mut config = config();
    config.loop_closure.enabled = false;
    let depth_model = DepthModel::new(&config.depth);
    let mut odometry = RgbdOdometry::new(config).unwrap();

    let pose = |i: usize| SE3::from_translation(Vector3::new(0.0, 0.0, 0.02 * i as f64));
    for i in 0..3 {
        let (frame, features) = scene.render(&pose(i), i as f64);
        odometry.process_frame(Arc::new(frame.with_features(features, &depth_model)));
    }

    // Depth dropout: same image, no features survive.
    let (frame, _) = scene.render(&pose(3), 3.0);
    let outcome = odometry.process_frame(Arc::new(
        frame.with_features(FeatureSet::default(), &depth_model),
    ));
    assert!(matches!(outcome.status, FrameStatus::Fallback(_)));

    for i in 4..7 {
        let (frame, features) = scene.render(&pose(i), i as f64);
        let outcome =
            odometry.process_frame(Arc::new(frame.with_features(features, &depth_model)));
        assert!(outcome.is_tracked(), "frame {i}: {:?}", outcome.status);
    }
    assert!(odometry.pose().approx_eq(&pose(6), 2e-2, 2e-2));
}

#[test]
fn mismatched_images_are_rejected() {
    let mut config = config();
    config.loop_closure.enabled = false;
    let mut odometry = RgbdOdometry::new(config).unwrap();
    let camera = CameraModel::new(525.0, 525.0, 319.5, 239.5, 640, 480);

    let result = odometry.process(
        FrameHeader::new(0.0, "camera"),
        camera,
        RgbImage::new(640, 480),
        DepthImage::new(320, 240),
        FeatureSet::default(),
    );

    assert!(result.is_err());
    assert!(odometry.trajectory().is_empty());
}
