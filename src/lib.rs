//! V4L2 capture session manager: open a camera, negotiate a format, stream
//! frames through memory-mapped kernel buffers and adjust controls while
//! streaming.

pub mod capture;
pub mod error;
pub mod utils;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Camera, ControlId, Format, FourCc, Frame, Wait};
pub use error::{CaptureError, Result};

use capture::{FormatRequest, RegisterTarget};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variables override file values, e.g. `FRAMEGRAB_CAPTURE__WIDTH=1280`.
pub const ENV_PREFIX: &str = "FRAMEGRAB";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node; empty means auto-detect.
    pub device: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<FourCc>,
    /// Best effort; ignored by drivers with a fixed rate.
    pub fps: Option<u32>,
    pub buffer_count: u32,
    /// Allocate buffers and start streaming as part of opening.
    pub autostart: bool,
    /// Upper bound for `Camera::read_frame`.
    pub read_timeout_ms: u64,
    /// Serialize every ioctl on the descriptor, for drivers that misbehave
    /// with concurrent control and streaming calls.
    pub serialize_ioctls: bool,
    /// Controls applied at open, by name (`gain`) or hex id.
    pub controls: BTreeMap<String, i64>,
    pub registers: RegisterTarget,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            width: None,
            height: None,
            format: None,
            fps: None,
            buffer_count: 4,
            autostart: true,
            read_timeout_ms: 2000,
            serialize_ioctls: false,
            controls: BTreeMap::new(),
            registers: RegisterTarget::default(),
        }
    }
}

impl CaptureConfig {
    pub fn for_device(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn format_request(&self) -> FormatRequest {
        FormatRequest {
            width: self.width,
            height: self.height,
            fourcc: self.format,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "framegrab=info".to_owned(),
        }
    }
}

impl Config {
    /// Defaults, then `path` (TOML) if given, then `FRAMEGRAB_*` environment variables.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
