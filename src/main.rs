//! rgbd-replay - run the odometry pipeline over persisted frames.
//!
//! Every sub-directory of the input directory is one frame saved by
//! `rust_rgbd::frame::save_frame`, plus a `features.yml` holding the keypoints
//! and descriptors an external detector produced for it. Frames are replayed
//! in lexical directory order and the resulting trajectory is written as CSV.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use rust_rgbd::config::OdometryConfig;
use rust_rgbd::frame::{load_frame, DepthModel, FeatureSet};
use rust_rgbd::registration::EstimatorKind;
use rust_rgbd::system::{FrameStatus, RgbdOdometry, TrajectoryPose};

const FEATURES_FILE: &str = "features.yml";

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Directory of persisted frames, one sub-directory per frame
    frames: PathBuf,

    /// YAML configuration; defaults apply to anything it leaves out
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured motion estimator
    #[arg(long, value_parser = parse_estimator)]
    estimator: Option<EstimatorKind>,

    /// Where to write the trajectory
    #[arg(long, default_value = "trajectory.csv")]
    output: PathBuf,

    /// Seconds to wait for pending loop closures before writing the trajectory
    #[arg(long, default_value_t = 30)]
    loop_timeout: u64,
}

fn parse_estimator(name: &str) -> Result<EstimatorKind, String> {
    EstimatorKind::ALL
        .into_iter()
        .find(|kind| kind.name() == name)
        .ok_or_else(|| {
            let known: Vec<&str> = EstimatorKind::ALL.iter().map(|k| k.name()).collect();
            format!("unknown estimator '{name}', expected one of {}", known.join(", "))
        })
}

#[derive(Debug, Serialize)]
struct TrajectoryRow {
    timestamp: f64,
    x: f64,
    y: f64,
    z: f64,
    qx: f64,
    qy: f64,
    qz: f64,
    qw: f64,
    keyframe: u64,
}

impl From<&TrajectoryPose> for TrajectoryRow {
    fn from(entry: &TrajectoryPose) -> Self {
        let t = entry.pose.translation;
        let q = entry.pose.rotation.quaternion();
        Self {
            timestamp: entry.timestamp,
            x: t.x,
            y: t.y,
            z: t.z,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            qw: q.w,
            keyframe: entry.keyframe.0,
        }
    }
}

fn write_trajectory(path: &Path, trajectory: &[TrajectoryPose]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for entry in trajectory {
        writer.serialize(TrajectoryRow::from(entry))?;
    }
    writer.flush()?;
    Ok(())
}

/// Frame directories under `root`, in lexical order.
fn frame_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("failed to list {}", root.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => OdometryConfig::from_yaml_file(path)?,
        None => OdometryConfig::default(),
    };
    if let Some(kind) = args.estimator {
        config.registration.estimator = kind;
    }

    let dirs = frame_dirs(&args.frames)?;
    info!(frames = dirs.len(), dir = %args.frames.display(), "Replaying frames");

    let depth_model = DepthModel::new(&config.depth);
    let mut odometry = RgbdOdometry::new(config)?;
    let mut tracked = 0usize;
    let mut fallbacks = 0usize;

    for dir in &dirs {
        let frame = load_frame(dir).with_context(|| format!("failed to load {}", dir.display()))?;
        let features = FeatureSet::from_yaml_file(&dir.join(FEATURES_FILE))?;
        let frame = frame.with_features(features, &depth_model);

        let outcome = odometry.process_frame(Arc::new(frame));
        match &outcome.status {
            FrameStatus::Tracked(_) => tracked += 1,
            FrameStatus::Fallback(_) => fallbacks += 1,
            FrameStatus::Initialized | FrameStatus::OutOfOrder { .. } => {}
        }
        if let Some(event) = outcome.keyframe {
            info!(keyframe = %event.id, timestamp = event.timestamp, "New keyframe");
        }
    }

    let late = odometry.flush_loop_closure(Duration::from_secs(args.loop_timeout));
    if !late.is_empty() {
        info!(corrections = late.len(), "Applied pending loop closures");
    }

    let snapshot = odometry.snapshot();
    if fallbacks > 0 {
        warn!(fallbacks, "Some frames used the motion model");
    }
    info!(
        tracked,
        keyframes = snapshot.graph.len(),
        loops = snapshot.graph.loop_edges().count(),
        "Replay finished"
    );

    write_trajectory(&args.output, snapshot.integrator.trajectory())?;
    info!(path = %args.output.display(), "Wrote trajectory");

    odometry.shutdown();
    Ok(())
}
