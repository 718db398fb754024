use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use memmap2::Mmap;
use tracing::warn;

use crate::capture::format::{FourCc, Format};
use crate::error::Result;

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Index of the kernel buffer backing the frame.
    pub index: u32,
    pub sequence: u32,
    /// Capture time on the monotonic clock.
    pub timestamp: Duration,
    pub bytes_used: u32,
    pub format: Format,
}

/// Whoever owns the buffer pool a frame was dequeued from.
pub(crate) trait BufferReturn: Send + Sync {
    /// Hand buffer `index` of pool `pool_id` back: re-queued while streaming,
    /// idle otherwise, ignored when the pool has since been released.
    fn give_back(&self, pool_id: u64, index: u32) -> Result<()>;
}

struct Lease {
    owner: Weak<dyn BufferReturn>,
    pool_id: u64,
}

/// One captured image, borrowed from a mapped kernel buffer.
///
/// The data is valid for as long as the frame lives. Dropping the frame hands
/// the buffer back to the driver; `release()` does the same and reports errors.
pub struct Frame {
    mapping: Arc<Mmap>,
    meta: FrameMetadata,
    lease: Option<Lease>,
}

impl Frame {
    pub(crate) fn new(
        mapping: Arc<Mmap>,
        meta: FrameMetadata,
        owner: Weak<dyn BufferReturn>,
        pool_id: u64,
    ) -> Self {
        Self {
            mapping,
            meta,
            lease: Some(Lease { owner, pool_id }),
        }
    }

    /// Valid image bytes; drivers that leave `bytesused` at zero get the full image size.
    pub fn data(&self) -> &[u8] {
        let used = match self.meta.bytes_used {
            0 => self.meta.format.size,
            n => n,
        };
        let len = (used as usize).min(self.mapping.len());
        &self.mapping[..len]
    }

    /// Pixel bytes of row `y`, excluding stride padding. `None` for compressed
    /// or planar encodings and rows outside the image.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let range = self.meta.format.row_range(y)?;
        self.data().get(range)
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn index(&self) -> u32 {
        self.meta.index
    }

    pub fn sequence(&self) -> u32 {
        self.meta.sequence
    }

    pub fn timestamp(&self) -> Duration {
        self.meta.timestamp
    }

    pub fn width(&self) -> u32 {
        self.meta.format.width
    }

    pub fn height(&self) -> u32 {
        self.meta.format.height
    }

    pub fn stride(&self) -> u32 {
        self.meta.format.stride
    }

    pub fn fourcc(&self) -> FourCc {
        self.meta.format.fourcc
    }

    /// Copy the image out so the buffer can be returned immediately.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.data())
    }

    /// Return the buffer to the driver now.
    pub fn release(mut self) -> Result<()> {
        self.give_back()
    }

    fn give_back(&mut self) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };
        match lease.owner.upgrade() {
            Some(owner) => owner.give_back(lease.pool_id, self.meta.index),
            // The camera is gone and its buffers with it.
            None => Ok(()),
        }
    }
}

impl Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Err(err) = self.give_back() {
            warn!("Failed to return buffer {}: {}", self.meta.index, err);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.meta.index)
            .field("sequence", &self.meta.sequence)
            .field("timestamp", &self.meta.timestamp)
            .field("bytes_used", &self.meta.bytes_used)
            .field("format", &self.meta.format)
            .finish()
    }
}
