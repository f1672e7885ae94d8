//! Directory-based frame storage for offline replay.
//!
//! A frame directory holds:
//!
//! ```text
//! <dir>/rgb.png     8-bit RGB
//! <dir>/depth.png   16-bit grey, raw sensor units
//! <dir>/frame.yml   header, intrinsics and depth scale
//! ```
//!
//! Saving writes into a hidden sibling directory and renames it into place,
//! so a partially written frame is never visible under the final name.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::camera::CameraModel;
use super::rgbd_frame::{FrameError, FrameHeader, RgbdFrame};

pub const RGB_FILE: &str = "rgb.png";
pub const DEPTH_FILE: &str = "depth.png";
pub const METADATA_FILE: &str = "frame.yml";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("frame directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error("required file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("parent directory of {0} does not exist")]
    MissingParent(PathBuf),

    #[error("i/o error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image error on {path}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid metadata in {path}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("inconsistent frame data")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameMetadata {
    header: FrameHeader,
    camera: CameraModel,
    depth_scale: f64,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write a frame's images and metadata to `dir`, replacing any previous frame there.
pub fn save_frame(frame: &RgbdFrame, dir: &Path) -> Result<(), PersistenceError> {
    let parent = match dir.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => return Err(PersistenceError::MissingParent(dir.to_path_buf())),
    };
    if !parent.is_dir() {
        return Err(PersistenceError::MissingParent(dir.to_path_buf()));
    }
    let name = dir
        .file_name()
        .ok_or_else(|| PersistenceError::MissingParent(dir.to_path_buf()))?;

    let staging = parent.join(format!(".{}.partial", name.to_string_lossy()));
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io_err(&staging))?;
    }
    fs::create_dir(&staging).map_err(io_err(&staging))?;

    if let Err(e) = write_contents(frame, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_err(dir))?;
    }
    fs::rename(&staging, dir).map_err(io_err(dir))?;

    tracing::debug!(path = %dir.display(), timestamp = frame.timestamp(), "Saved frame");
    Ok(())
}

fn write_contents(frame: &RgbdFrame, dir: &Path) -> Result<(), PersistenceError> {
    let rgb_path = dir.join(RGB_FILE);
    frame
        .rgb()
        .save(&rgb_path)
        .map_err(|source| PersistenceError::Image {
            path: rgb_path.clone(),
            source,
        })?;

    let depth_path = dir.join(DEPTH_FILE);
    frame
        .depth()
        .save(&depth_path)
        .map_err(|source| PersistenceError::Image {
            path: depth_path.clone(),
            source,
        })?;

    let meta_path = dir.join(METADATA_FILE);
    let metadata = FrameMetadata {
        header: frame.header().clone(),
        camera: *frame.camera(),
        depth_scale: frame.depth_scale(),
    };
    let yaml = serde_yaml::to_string(&metadata).map_err(|source| PersistenceError::Metadata {
        path: meta_path.clone(),
        source,
    })?;
    fs::write(&meta_path, yaml).map_err(io_err(&meta_path))?;
    Ok(())
}

/// Load a frame saved by [`save_frame`]. The result carries no features.
///
/// All required files are checked before anything is read.
pub fn load_frame(dir: &Path) -> Result<RgbdFrame, PersistenceError> {
    if !dir.is_dir() {
        return Err(PersistenceError::MissingDirectory(dir.to_path_buf()));
    }
    let rgb_path = dir.join(RGB_FILE);
    let depth_path = dir.join(DEPTH_FILE);
    let meta_path = dir.join(METADATA_FILE);
    for path in [&rgb_path, &depth_path, &meta_path] {
        if !path.is_file() {
            return Err(PersistenceError::MissingFile(path.clone()));
        }
    }

    let yaml = fs::read_to_string(&meta_path).map_err(io_err(&meta_path))?;
    let metadata: FrameMetadata =
        serde_yaml::from_str(&yaml).map_err(|source| PersistenceError::Metadata {
            path: meta_path.clone(),
            source,
        })?;

    let rgb = image::open(&rgb_path)
        .map_err(|source| PersistenceError::Image {
            path: rgb_path.clone(),
            source,
        })?
        .into_rgb8();
    let depth = image::open(&depth_path)
        .map_err(|source| PersistenceError::Image {
            path: depth_path.clone(),
            source,
        })?
        .into_luma16();

    Ok(RgbdFrame::new(
        metadata.header,
        metadata.camera,
        rgb,
        depth,
        metadata.depth_scale,
    )?)
}
