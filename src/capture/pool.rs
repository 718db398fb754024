//! Memory-mapped kernel buffers and who owns each one

use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, info, instrument, warn};

use crate::capture::device::{Camera, Shared};
use crate::capture::driver::{BufferLayout, Driver};
use crate::capture::format::Format;
use crate::capture::session::{SessionState, StreamState};
use crate::error::{self, CaptureError, Result};

/// Who currently owns a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Held by the pool, not queued (after allocation or `stop`).
    Idle,
    /// Queued to the driver, waiting to be filled.
    Queued,
    /// Lent to the caller as a `Frame`.
    Dequeued,
}

pub(crate) struct BufferSlot {
    layout: BufferLayout,
    pub(crate) mapping: Arc<Mmap>,
    pub(crate) state: BufferState,
}

impl BufferSlot {
    pub fn index(&self) -> u32 {
        self.layout.index
    }

    #[cfg(test)]
    pub fn length(&self) -> u32 {
        self.layout.length
    }

    #[cfg(test)]
    pub fn state(&self) -> BufferState {
        self.state
    }
}

/// The fixed set of buffers shared with the driver.
pub(crate) struct BufferPool {
    id: u64,
    slots: Vec<BufferSlot>,
}

impl BufferPool {
    /// Request, query and map `count` buffers. On any failure the mappings made so
    /// far are dropped and the kernel allocation is freed again.
    pub(crate) fn allocate<D: Driver>(
        driver: &D,
        path: &str,
        format: &Format,
        count: u32,
        id: u64,
    ) -> Result<Self> {
        let failed = |reason: String| CaptureError::BufferAllocationFailed {
            requested: count,
            reason,
        };
        if count == 0 {
            return Err(failed("buffer count must be positive".into()));
        }

        let granted = driver
            .request_buffers(count)
            .map_err(|err| error::classify(path, err, |err| failed(err.to_string())))?;

        let mapped = (|| {
            if granted < count {
                return Err(failed(format!("driver granted only {granted}")));
            }

            let mut slots = Vec::with_capacity(granted as usize);
            for index in 0..granted {
                let layout = driver.query_buffer(index).map_err(|err| {
                    error::classify(path, err, |err| failed(format!("query buffer {index}: {err}")))
                })?;

                if let Some(first) = slots.first().map(|slot: &BufferSlot| slot.layout.length) {
                    if layout.length != first {
                        return Err(failed(format!(
                            "buffer {index} is {} bytes, buffer 0 is {first}",
                            layout.length
                        )));
                    }
                }
                if layout.length < format.size {
                    return Err(failed(format!(
                        "buffer {index} is {} bytes, the image needs {}",
                        layout.length, format.size
                    )));
                }

                let mapping = driver.map_buffer(&layout).map_err(|err| {
                    error::classify(path, err, |err| failed(format!("map buffer {index}: {err}")))
                })?;
                debug!(
                    "Mapped buffer {} ({} bytes at offset {})",
                    index, layout.length, layout.offset
                );

                slots.push(BufferSlot {
                    layout,
                    mapping: Arc::new(mapping),
                    state: BufferState::Idle,
                });
            }
            Ok(slots)
        })();

        match mapped {
            Ok(slots) => Ok(Self { id, slots }),
            Err(err) => {
                // Partial mappings are already dropped; give the kernel its memory back.
                if let Err(free_err) = driver.request_buffers(0) {
                    warn!("Failed to free buffers after allocation error: {}", free_err);
                }
                Err(err)
            }
        }
    }

    /// Unmap everything, then free the kernel buffers.
    pub(crate) fn release<D: Driver>(self, driver: &D, path: &str) -> Result<()> {
        let held = self.held();
        drop(self.slots);

        match driver.request_buffers(0) {
            Ok(_) => Ok(()),
            // Frames the caller still holds keep their pages mapped; the kernel frees them later.
            Err(err) if held > 0 && err.raw_os_error() == Some(libc::EBUSY) => {
                warn!("{} buffers still referenced; kernel release deferred", held);
                Ok(())
            }
            Err(err) => Err(error::classify(path, err, CaptureError::Io)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [BufferSlot] {
        &mut self.slots
    }

    pub(crate) fn slot_mut(&mut self, index: u32) -> Option<&mut BufferSlot> {
        self.slots.get_mut(index as usize)
    }

    pub fn count(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// Buffers currently lent out as frames.
    pub fn held(&self) -> usize {
        self.count(BufferState::Dequeued)
    }
}

impl<D: Driver> Shared<D> {
    /// Drop the pool. Unless `force`d, refuses while frames are outstanding.
    pub(crate) fn release_locked(&self, stream: &mut StreamState, force: bool) -> Result<()> {
        let Some(pool) = stream.pool.take() else {
            return Ok(());
        };
        if !force && pool.held() > 0 {
            stream.pool = Some(pool);
            return Err(CaptureError::InvalidState("frames from this pool are still held"));
        }

        let count = pool.len();
        self.with_driver(|driver| pool.release(driver, &self.path))?;
        info!("Released {} buffers", count);
        Ok(())
    }
}

impl<D: Driver> Camera<D> {
    /// Allocate `count` mmap buffers, replacing any idle pool.
    #[instrument(skip(self), fields(device = %self.shared.path))]
    pub fn allocate(&self, count: u32) -> Result<usize> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let mut stream = shared.lock_stream();
        if stream.state == SessionState::Streaming {
            return Err(CaptureError::InvalidState("cannot allocate buffers while streaming"));
        }
        shared.release_locked(&mut stream, false)?;

        let id = shared.next_pool_id();
        let pool = shared.with_driver(|driver| {
            BufferPool::allocate(driver, &shared.path, &shared.format, count, id)
        })?;
        let granted = pool.len();
        stream.pool = Some(pool);

        info!("Allocated {} buffers of {} bytes", granted, shared.format.size);
        Ok(granted)
    }

    /// Free the pool. Fails while streaming or while frames are still held.
    #[instrument(skip(self), fields(device = %self.shared.path))]
    pub fn release_buffers(&self) -> Result<()> {
        let mut stream = self.shared.lock_stream();
        if stream.state == SessionState::Streaming {
            return Err(CaptureError::InvalidState("cannot release buffers while streaming"));
        }
        self.shared.release_locked(&mut stream, false)
    }

    /// Frames currently lent out and not yet dropped or released.
    pub fn held_frames(&self) -> usize {
        self.shared
            .lock_stream()
            .pool
            .as_ref()
            .map_or(0, BufferPool::held)
    }

    pub fn buffer_count(&self) -> usize {
        self.shared
            .lock_stream()
            .pool
            .as_ref()
            .map_or(0, BufferPool::len)
    }
}
