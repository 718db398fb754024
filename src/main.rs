//! Capture 500 frames and print the mean pixel value of each.
//!
//! Usage: `framegrab [config.toml]`. Settings can also come from
//! `FRAMEGRAB_*` environment variables, e.g. `FRAMEGRAB_CAPTURE__DEVICE=/dev/video2`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use flume::bounded;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use framegrab::{utils, Camera, CaptureError, Config, Wait};

const FRAMES: usize = 500;

struct FrameStats {
    sequence: u32,
    timestamp: Duration,
    mean: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("framegrab launching...");

    if config.capture.device.is_empty() {
        config.capture.device = utils::auto_detect_device(config.capture.format)?.path;
    }
    info!("Using capture device: {}", config.capture.device);
    framegrab::CONFIG.store(Arc::new(config.clone()));

    let camera = Arc::new(Camera::open_with(&config.capture)?);
    if !camera.is_streaming() {
        camera.allocate(config.capture.buffer_count)?;
        camera.start()?;
    }
    info!("Format: {}", camera.format());

    let (tx, rx) = bounded::<FrameStats>(32);

    let timeout = config.capture.read_timeout();
    let capture = {
        let camera = Arc::clone(&camera);
        tokio::task::spawn_blocking(move || -> framegrab::Result<usize> {
            for captured in 0..FRAMES {
                let frame = match camera.dequeue_frame(Wait::Timeout(timeout)) {
                    Ok(frame) => frame,
                    Err(CaptureError::Interrupted) => return Ok(captured),
                    Err(err) => return Err(err),
                };

                let sum: u64 = frame.iter().map(|&b| u64::from(b)).sum();
                let stats = FrameStats {
                    sequence: frame.sequence(),
                    timestamp: frame.timestamp(),
                    mean: sum as f64 / frame.len().max(1) as f64,
                };
                camera.release_frame(frame)?;

                if tx.send(stats).is_err() {
                    return Ok(captured + 1);
                }
            }
            Ok(FRAMES)
        })
    };

    let interrupter = {
        let camera = Arc::clone(&camera);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping capture");
                if let Err(err) = camera.interrupt() {
                    error!("Failed to interrupt capture: {}", err);
                }
            }
        })
    };

    let started = Instant::now();
    while let Ok(stats) = rx.recv_async().await {
        println!("{:.3}", stats.mean);
        tracing::debug!(
            "frame {} at {:?}: mean {:.3}",
            stats.sequence,
            stats.timestamp,
            stats.mean
        );
    }

    let captured = capture.await.map_err(|err| eyre!("capture task failed: {err}"))??;
    interrupter.abort();

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        "Captured {} frames in {:.2}s ({:.1} fps)",
        captured,
        elapsed,
        captured as f64 / elapsed.max(f64::EPSILON)
    );

    camera.close()?;
    info!("framegrab shutting down");
    Ok(())
}
