//! Streaming state machine: start, stop, dequeue and requeue
//!
//! The stream mutex is never held while waiting for the device, so `stop`,
//! `interrupt`, `close` and frame drops from other threads are never blocked
//! behind a capture loop.

use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, gauge};
use nix::time::{clock_gettime, ClockId};
use tracing::{debug, info, instrument, warn};

use crate::capture::device::{Camera, Shared};
use crate::capture::driver::{Driver, Readiness};
use crate::capture::frame::{BufferReturn, Frame, FrameMetadata};
use crate::capture::pool::{BufferPool, BufferState};
use crate::error::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Streaming,
}

/// Everything guarded by the stream mutex.
pub(crate) struct StreamState {
    pub(crate) state: SessionState,
    pub(crate) pool: Option<BufferPool>,
}

impl StreamState {
    pub(crate) fn new() -> Self {
        Self {
            state: SessionState::Stopped,
            pool: None,
        }
    }
}

/// How long `dequeue_frame` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return `WouldBlock` at once if no frame is ready.
    Poll,
    /// Return `Timeout` once the duration elapses. A zero duration acts as `Poll`.
    Timeout(Duration),
    /// Block until a frame arrives or the wait is interrupted.
    Forever,
}

impl Wait {
    fn limit(self) -> Option<Duration> {
        match self {
            Self::Poll => Some(Duration::ZERO),
            Self::Timeout(duration) => Some(duration),
            Self::Forever => None,
        }
    }

    fn is_poll(self) -> bool {
        self.limit() == Some(Duration::ZERO)
    }
}

/// Re-check interval while every buffer is held by the caller.
const STARVED_BACKOFF: Duration = Duration::from_millis(5);

fn monotonic_now() -> Duration {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(Duration::from)
        .unwrap_or_default()
}

impl<D: Driver> Shared<D> {
    pub(crate) fn stop_locked(&self, stream: &mut StreamState) -> Result<()> {
        if stream.state != SessionState::Streaming {
            return Err(CaptureError::InvalidState("not streaming"));
        }

        let result = self.with_driver(|driver| {
            driver
                .stream_off()
                .map_err(|err| self.classify(err, CaptureError::Io))
        });

        // STREAMOFF reclaims every queued buffer, even when it reports an error.
        if let Some(pool) = stream.pool.as_mut() {
            for slot in pool.slots_mut() {
                if slot.state == BufferState::Queued {
                    slot.state = BufferState::Idle;
                }
            }
        }
        stream.state = SessionState::Stopped;

        result?;
        info!("Streaming stopped");
        Ok(())
    }

    fn publish_held(&self, pool: &BufferPool) {
        gauge!("framegrab_buffers_held", "device" => self.path.clone()).set(pool.held() as f64);
    }

    /// Take the next filled buffer, if the driver has one.
    fn try_dequeue(&self, stream: &mut StreamState) -> Result<Option<Frame>> {
        if self.is_closed() {
            return Err(CaptureError::Interrupted);
        }
        if stream.state != SessionState::Streaming {
            return Err(CaptureError::InvalidState("stream stopped while waiting"));
        }
        let Some(pool) = stream.pool.as_mut() else {
            return Err(CaptureError::InvalidState("no buffers allocated"));
        };

        let dequeued = self.with_driver(|driver| match driver.dequeue_buffer() {
            Ok(buffer) => Ok(Some(buffer)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(self.classify(err, CaptureError::Io)),
        })?;
        let Some(buffer) = dequeued else {
            return Ok(None);
        };

        let pool_id = pool.id();
        let pool_len = pool.len();
        let Some(slot) = pool.slot_mut(buffer.index) else {
            return Err(CaptureError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("driver returned buffer {} of a {pool_len} buffer pool", buffer.index),
            )));
        };

        if buffer.corrupted {
            warn!(
                "Buffer {} flagged corrupted by the driver, dropping frame {}",
                buffer.index, buffer.sequence
            );
            counter!("framegrab_frames_corrupted_total", "device" => self.path.clone())
                .increment(1);
            self.with_driver(|driver| {
                driver
                    .queue_buffer(buffer.index)
                    .map_err(|err| self.classify(err, CaptureError::Io))
            })?;
            return Ok(None);
        }

        slot.state = BufferState::Dequeued;
        let mapping = Arc::clone(&slot.mapping);
        let meta = FrameMetadata {
            index: buffer.index,
            sequence: buffer.sequence,
            timestamp: buffer.timestamp.unwrap_or_else(monotonic_now),
            bytes_used: buffer.bytes_used,
            format: self.format,
        };

        counter!("framegrab_frames_dequeued_total", "device" => self.path.clone()).increment(1);
        self.publish_held(pool);

        let owner: Weak<dyn BufferReturn> = self.weak_self();
        Ok(Some(Frame::new(mapping, meta, owner, pool_id)))
    }
}

impl<D: Driver> BufferReturn for Shared<D> {
    fn give_back(&self, pool_id: u64, index: u32) -> Result<()> {
        let mut stream = self.lock_stream();
        let requeue = stream.state == SessionState::Streaming && !self.is_closed();

        let Some(pool) = stream.pool.as_mut().filter(|pool| pool.id() == pool_id) else {
            debug!("Buffer {} belongs to a released pool", index);
            return Ok(());
        };
        let Some(slot) = pool.slot_mut(index) else {
            return Ok(());
        };
        if slot.state != BufferState::Dequeued {
            return Ok(());
        }

        let result = if requeue {
            self.with_driver(|driver| {
                driver
                    .queue_buffer(index)
                    .map_err(|err| self.classify(err, CaptureError::Io))
            })
        } else {
            Ok(())
        };
        slot.state = match result {
            Ok(()) if requeue => BufferState::Queued,
            _ => BufferState::Idle,
        };
        self.publish_held(pool);
        result
    }
}

impl<D: Driver> Camera<D> {
    /// Queue every idle buffer and turn the stream on.
    #[instrument(skip(self), fields(device = %self.shared.path))]
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let mut stream = shared.lock_stream();
        if stream.state == SessionState::Streaming {
            return Err(CaptureError::InvalidState("already streaming"));
        }
        let Some(pool) = stream.pool.as_mut() else {
            return Err(CaptureError::InvalidState("no buffers allocated"));
        };

        let queued = shared.with_driver(|driver| {
            let mut queued = 0;
            let mut result = Ok(());
            for slot in pool.slots_mut() {
                if slot.state != BufferState::Idle {
                    continue;
                }
                if let Err(err) = driver.queue_buffer(slot.index()) {
                    result = Err(err);
                    break;
                }
                slot.state = BufferState::Queued;
                queued += 1;
            }
            let result = result.and_then(|()| driver.stream_on());

            if let Err(err) = result {
                // Pull back whatever was queued before the failure.
                if let Err(off_err) = driver.stream_off() {
                    warn!("STREAMOFF after failed start: {}", off_err);
                }
                for slot in pool.slots_mut() {
                    if slot.state == BufferState::Queued {
                        slot.state = BufferState::Idle;
                    }
                }
                return Err(shared.classify(err, CaptureError::StreamStartFailed));
            }
            Ok(queued)
        })?;

        if queued == 0 {
            warn!("Streaming with no buffers queued; release held frames to receive new ones");
        }
        stream.state = SessionState::Streaming;
        info!("Streaming started with {} buffers queued", queued);
        Ok(())
    }

    /// Turn the stream off. Queued buffers return to the pool; held frames stay valid.
    #[instrument(skip(self), fields(device = %self.shared.path))]
    pub fn stop(&self) -> Result<()> {
        self.shared.ensure_open()?;
        let mut stream = self.shared.lock_stream();
        self.shared.stop_locked(&mut stream)
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock_stream().state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Wait for the next filled buffer and lend it out as a `Frame`.
    ///
    /// `Timeout` and `WouldBlock` are transient; `Interrupted` follows `interrupt()`
    /// or `close()` from another thread; `DeviceUnavailable` means the device is gone.
    pub fn dequeue_frame(&self, wait: Wait) -> Result<Frame> {
        let shared = &self.shared;
        let deadline = wait.limit().map(|limit| Instant::now() + limit);

        loop {
            {
                shared.ensure_open()?;
                let mut stream = shared.lock_stream();
                if stream.state != SessionState::Streaming {
                    return Err(CaptureError::InvalidState("dequeue while not streaming"));
                }
                // A buffer may already be done; skip the wait then.
                if let Some(frame) = shared.try_dequeue(&mut stream)? {
                    return Ok(frame);
                }
                if let Some(pool) = stream.pool.as_ref() {
                    if pool.count(BufferState::Queued) == 0 {
                        debug!("No buffers queued, all {} are held by the caller", pool.held());
                    }
                }
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let readiness = shared.with_driver(|driver| {
                driver
                    .wait(remaining)
                    .map_err(|err| shared.classify(err, CaptureError::Io))
            })?;

            match readiness {
                Readiness::Ready => {}
                Readiness::TimedOut => {
                    counter!("framegrab_dequeue_timeouts_total", "device" => shared.path.clone())
                        .increment(1);
                    return Err(if wait.is_poll() {
                        CaptureError::WouldBlock
                    } else {
                        CaptureError::Timeout
                    });
                }
                Readiness::Interrupted => return Err(CaptureError::Interrupted),
                Readiness::Error => {
                    if shared.is_closed() {
                        return Err(CaptureError::Interrupted);
                    }
                    let starved = {
                        let stream = shared.lock_stream();
                        if stream.state != SessionState::Streaming {
                            return Err(CaptureError::InvalidState("stream stopped while waiting"));
                        }
                        stream
                            .pool
                            .as_ref()
                            .is_some_and(|pool| pool.count(BufferState::Queued) == 0)
                    };
                    if !starved {
                        return Err(CaptureError::DeviceUnavailable {
                            path: shared.path.clone(),
                            reason: "device reported an error while streaming".into(),
                        });
                    }

                    // The kernel flags POLLERR while nothing is queued; wait for a
                    // frame to be handed back instead.
                    let now = Instant::now();
                    if deadline.is_some_and(|d| now >= d) {
                        return Err(if wait.is_poll() {
                            CaptureError::WouldBlock
                        } else {
                            CaptureError::Timeout
                        });
                    }
                    let pause =
                        deadline.map_or(STARVED_BACKOFF, |d| (d - now).min(STARVED_BACKOFF));
                    std::thread::sleep(pause);
                    continue;
                }
            }

            let mut stream = shared.lock_stream();
            if let Some(frame) = shared.try_dequeue(&mut stream)? {
                return Ok(frame);
            }
            // Spurious readiness: loop until the deadline.
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(if wait.is_poll() {
                    CaptureError::WouldBlock
                } else {
                    CaptureError::Timeout
                });
            }
        }
    }

    /// Hand a frame's buffer back to the driver. Equivalent to dropping the frame,
    /// but reports a failed requeue.
    pub fn release_frame(&self, frame: Frame) -> Result<()> {
        frame.release()
    }

    /// Capture one frame, copy it out and return the buffer immediately.
    ///
    /// Waits at most the configured read timeout.
    pub fn read_frame(&self) -> Result<Bytes> {
        let frame = self.dequeue_frame(Wait::Timeout(self.shared.config.read_timeout()))?;
        let data = frame.to_bytes();
        frame.release()?;
        Ok(data)
    }

    /// Make a blocked (or the next) `dequeue_frame` return `Interrupted`.
    pub fn interrupt(&self) -> Result<()> {
        self.shared.with_driver(|driver| {
            driver
                .interrupt()
                .map_err(|err| self.shared.classify(err, CaptureError::Io))
        })
    }
}
