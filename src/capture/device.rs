//! Opening, negotiating and closing a capture device

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::{debug, info, instrument, warn};

use crate::capture::controls::ControlId;
use crate::capture::driver::{DeviceCapabilities, Driver, V4l2Driver};
use crate::capture::format::{Format, FormatRequest};
use crate::capture::frame::BufferReturn;
use crate::capture::session::{SessionState, StreamState};
use crate::error::{self, CaptureError, Result};
use crate::CaptureConfig;

/// State shared by a `Camera`, its control registries and its outstanding frames.
pub(crate) struct Shared<D: Driver> {
    pub(crate) path: String,
    pub(crate) format: Format,
    pub(crate) capabilities: DeviceCapabilities,
    pub(crate) config: CaptureConfig,
    /// `None` once closed; taking it closes the descriptor.
    driver: RwLock<Option<D>>,
    /// Session state and buffer pool. Lock before the driver, never across a wait.
    stream: Mutex<StreamState>,
    closed: AtomicBool,
    next_pool_id: AtomicU64,
    this: Weak<Shared<D>>,
}

impl<D: Driver> Shared<D> {
    pub(crate) fn with_driver<T>(&self, f: impl FnOnce(&D) -> Result<T>) -> Result<T> {
        let guard = self.driver.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(driver) => f(driver),
            None => Err(CaptureError::InvalidState("device is closed")),
        }
    }

    pub(crate) fn lock_stream(&self) -> MutexGuard<'_, StreamState> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CaptureError::InvalidState("device is closed"));
        }
        Ok(())
    }

    pub(crate) fn next_pool_id(&self) -> u64 {
        self.next_pool_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn weak_self(&self) -> Weak<dyn BufferReturn> {
        self.this.clone()
    }

    pub(crate) fn classify(
        &self,
        err: io::Error,
        otherwise: impl FnOnce(io::Error) -> CaptureError,
    ) -> CaptureError {
        error::classify(&self.path, err, otherwise)
    }
}

/// An open V4L2 capture device with a negotiated format.
///
/// All methods take `&self`; a `Camera` can be shared between a capture thread
/// and a control thread. Dropping it closes the device.
pub struct Camera<D: Driver = V4l2Driver> {
    pub(crate) shared: Arc<Shared<D>>,
}

impl Camera<V4l2Driver> {
    /// Open `path` and negotiate `width` x `height`; `None` keeps the driver's value.
    ///
    /// Everything else (pixel format, buffer count, autostart, timeouts) comes
    /// from the global [`CONFIG`](crate::CONFIG).
    pub fn open(path: impl AsRef<Path>, width: Option<u32>, height: Option<u32>) -> Result<Self> {
        let mut config = crate::CONFIG.load().capture.clone();
        config.device = path.as_ref().display().to_string();
        config.width = width;
        config.height = height;
        Self::open_with(&config)
    }

    pub fn open_with(config: &CaptureConfig) -> Result<Self> {
        let driver = V4l2Driver::open(Path::new(&config.device), config.serialize_ioctls)
            .map_err(|err| CaptureError::DeviceUnavailable {
                path: config.device.clone(),
                reason: err.to_string(),
            })?;
        Self::with_driver(driver, config)
    }
}

impl<D: Driver> Camera<D> {
    /// Validate the device, negotiate the format, apply configured controls and,
    /// with `autostart`, allocate buffers and start streaming.
    #[instrument(skip(driver, config), fields(device = %config.device))]
    pub fn with_driver(driver: D, config: &CaptureConfig) -> Result<Self> {
        let path = config.device.clone();
        let unavailable = |reason: String| CaptureError::DeviceUnavailable {
            path: path.clone(),
            reason,
        };

        let capabilities = driver
            .capabilities()
            .map_err(|err| unavailable(format!("query capabilities: {err}")))?;
        info!("Device: {} ({}, {})", capabilities.card, capabilities.driver, capabilities.bus_info);

        if !capabilities.can_capture {
            return Err(unavailable("not a video capture device".into()));
        }
        if !capabilities.can_stream {
            return Err(unavailable("device does not support streaming I/O".into()));
        }

        let format = negotiate(&driver, &path, &config.format_request())?;
        info!("Negotiated format: {}", format);

        if let Some(fps) = config.fps {
            // Best effort; many sensors only run at their native rate.
            match driver.set_frame_rate(fps) {
                Ok(()) => debug!("Requested {} fps", fps),
                Err(err) => warn!("Failed to set frame rate to {}: {}", fps, err),
            }
        }

        let camera = Self {
            shared: Arc::new_cyclic(|this| Shared {
                path,
                format,
                capabilities,
                config: config.clone(),
                driver: RwLock::new(Some(driver)),
                stream: Mutex::new(StreamState::new()),
                closed: AtomicBool::new(false),
                next_pool_id: AtomicU64::new(1),
                this: this.clone(),
            }),
        };

        camera.apply_configured_controls()?;

        if config.autostart {
            camera.allocate(config.buffer_count)?;
            camera.start()?;
        }

        Ok(camera)
    }

    fn apply_configured_controls(&self) -> Result<()> {
        let controls = self.controls();
        for (name, &value) in &self.shared.config.controls {
            let Some(id) = ControlId::from_name(name) else {
                warn!("Unknown control {:?} in configuration, skipping", name);
                continue;
            };
            let applied = controls.set_control(id, value)?;
            info!("Control {} = {}", id, applied);
        }
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn format(&self) -> Format {
        self.shared.format
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.shared.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop streaming, release buffers and close the descriptor. Idempotent.
    ///
    /// A blocked `dequeue_frame` on another thread returns `Interrupted`. Frames
    /// still held stay readable; dropping them afterwards is a no-op. Errors
    /// caused by the device having been unplugged are not reported.
    #[instrument(skip(self), fields(device = %self.shared.path))]
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        let mut note = |result: Result<()>| {
            if let Err(err) = result {
                if err.is_device_lost() {
                    debug!("Ignoring teardown error on lost device: {}", err);
                } else if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        };

        note(shared.with_driver(|driver| {
            driver
                .interrupt()
                .map_err(|err| shared.classify(err, CaptureError::Io))
        }));

        {
            let mut stream = shared.lock_stream();
            if stream.state == SessionState::Streaming {
                note(shared.stop_locked(&mut stream));
            }
            note(shared.release_locked(&mut stream, true));
        }

        let driver = shared
            .driver
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(driver);
        info!("Device closed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<D: Driver> Drop for Camera<D> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Error closing {}: {}", self.shared.path, err);
        }
    }
}

/// Settle on a format: the driver's current one when nothing is requested,
/// otherwise the requested fields applied on top of it.
fn negotiate<D: Driver>(driver: &D, path: &str, request: &FormatRequest) -> Result<Format> {
    let supported = driver.enum_formats().map_err(|err| {
        error::classify(path, err, |err| {
            CaptureError::FormatUnsupported(format!("cannot enumerate formats: {err}"))
        })
    })?;
    if supported.is_empty() {
        return Err(CaptureError::FormatUnsupported(
            "device enumerates no capture formats".into(),
        ));
    }
    debug!(
        "Supported formats: {}",
        supported.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    );

    if let Some(fourcc) = request.fourcc {
        if !supported.contains(&fourcc) {
            return Err(CaptureError::FormatUnsupported(format!(
                "{fourcc} not offered by the device"
            )));
        }
    }

    let current = driver
        .format()
        .map_err(|err| error::classify(path, err, CaptureError::Io))?;

    let actual = if request.is_empty() {
        current
    } else {
        let desired = request.apply(&current);
        let actual = driver.set_format(&desired).map_err(|err| {
            error::classify(path, err, |err| match err.raw_os_error() {
                Some(libc::EBUSY) => CaptureError::DeviceUnavailable {
                    path: path.to_owned(),
                    reason: "device is busy".into(),
                },
                _ => CaptureError::FormatUnsupported(format!("driver rejected {desired}: {err}")),
            })
        })?;

        if let Some(fourcc) = request.fourcc {
            if actual.fourcc != fourcc {
                return Err(CaptureError::FormatUnsupported(format!(
                    "asked for {fourcc}, driver chose {}",
                    actual.fourcc
                )));
            }
        }
        if actual.width != desired.width || actual.height != desired.height {
            info!(
                "Driver adjusted {}x{} to {}x{}",
                desired.width, desired.height, actual.width, actual.height
            );
        }
        actual
    };

    if actual.width == 0 || actual.height == 0 || actual.size == 0 {
        return Err(CaptureError::FormatUnsupported(format!(
            "driver reported an empty image: {actual}"
        )));
    }
    Ok(actual)
}
