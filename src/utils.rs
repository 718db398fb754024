use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::capability::Flags;
use v4l::video::Capture;
use v4l::Device;

use crate::capture::FourCc;
use crate::error::{CaptureError, Result};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub driver: String,
    pub formats: Vec<FourCc>,
}

/// `7` for `/dev/video7`.
pub fn node_index(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("video")?
        .parse()
        .ok()
}

/// Every `/dev/videoN` that supports streaming video capture, by ascending N.
///
/// Metadata and output nodes (UVC cameras expose both) are skipped.
pub fn capture_devices() -> Vec<FoundDevice> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };

    let mut nodes: Vec<(u32, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter_map(|path| node_index(&path).map(|index| (index, path)))
        .collect();
    nodes.sort();

    nodes.into_iter().filter_map(|(_, path)| probe(&path)).collect()
}

fn probe(path: &Path) -> Option<FoundDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
        || !caps.capabilities.contains(Flags::STREAMING)
    {
        debug!("Skipping {}: not a streaming capture node", path.display());
        return None;
    }

    let formats = dev
        .enum_formats()
        .map(|formats| formats.into_iter().map(|desc| desc.fourcc.into()).collect())
        .unwrap_or_default();

    Some(FoundDevice {
        path: path.display().to_string(),
        card: caps.card,
        driver: caps.driver,
        formats,
    })
}

/// The first device offering `preferred`, or the first device at all.
fn pick(devices: Vec<FoundDevice>, preferred: Option<FourCc>) -> Option<FoundDevice> {
    if let Some(fourcc) = preferred {
        if let Some(found) = devices.iter().find(|d| d.formats.contains(&fourcc)) {
            return Some(found.clone());
        }
    }
    devices.into_iter().next()
}

/// Auto-detect best capture device
pub fn auto_detect_device(preferred: Option<FourCc>) -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let found = pick(capture_devices(), preferred).ok_or_else(|| CaptureError::DeviceUnavailable {
        path: "/dev/video*".to_owned(),
        reason: "no streaming capture device found".to_owned(),
    })?;

    info!("Found {}: {} ({})", found.path, found.card, found.driver);
    Ok(found)
}
