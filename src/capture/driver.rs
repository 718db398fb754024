//! The kernel seam: every ioctl, mapping and wait the capture core issues

use std::io;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapOptions};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::debug;
use v4l::capability::Flags as CapFlags;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::capture::controls::{ControlDescriptor, RegisterTarget};
use crate::capture::format::{FourCc, Format};
use crate::capture::sys;

/// What the device reports about itself at open time.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub can_capture: bool,
    pub can_stream: bool,
}

/// Location of one kernel buffer inside the device's mmap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// A filled buffer handed back by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    /// Capture time on the monotonic clock, when the driver stamps buffers with it.
    pub timestamp: Option<Duration>,
    /// The driver flagged the contents as corrupted.
    pub corrupted: bool,
}

/// Outcome of waiting for the device to have a filled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    Interrupted,
    /// POLLERR/POLLHUP: the queue is in error or the device went away.
    Error,
}

/// Operations the capture core needs from a V4L2 device.
///
/// Errors are raw kernel errors; the core classifies them per operation.
pub trait Driver: Send + Sync + 'static {
    fn capabilities(&self) -> io::Result<DeviceCapabilities>;
    fn enum_formats(&self) -> io::Result<Vec<FourCc>>;
    fn format(&self) -> io::Result<Format>;
    /// Returns the format the driver actually applied.
    fn set_format(&self, format: &Format) -> io::Result<Format>;
    fn set_frame_rate(&self, fps: u32) -> io::Result<()>;

    /// REQBUFS; returns the count granted. `0` frees all buffers.
    fn request_buffers(&self, count: u32) -> io::Result<u32>;
    fn query_buffer(&self, index: u32) -> io::Result<BufferLayout>;
    fn map_buffer(&self, layout: &BufferLayout) -> io::Result<Mmap>;
    fn queue_buffer(&self, index: u32) -> io::Result<()>;
    /// Non-blocking; `WouldBlock` when nothing is ready.
    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer>;
    fn stream_on(&self) -> io::Result<()>;
    fn stream_off(&self) -> io::Result<()>;
    /// `None` waits forever.
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Readiness>;
    /// Make a current or the next `wait` return `Readiness::Interrupted`.
    fn interrupt(&self) -> io::Result<()>;

    fn query_control(&self, id: u32) -> io::Result<ControlDescriptor>;
    /// The control following `id` in driver order, `None` past the last one.
    fn next_control(&self, id: u32) -> io::Result<Option<ControlDescriptor>>;
    /// Raw menu entry: a name, or an `i64` in the first eight bytes for integer menus.
    fn menu_item(&self, id: u32, index: u32) -> io::Result<[u8; 32]>;
    fn get_control(&self, id: u32) -> io::Result<i32>;
    /// Returns the value the driver applied.
    fn set_control(&self, id: u32, value: i32) -> io::Result<i32>;

    fn read_register(&self, target: &RegisterTarget, address: u64) -> io::Result<u64>;
    fn write_register(&self, target: &RegisterTarget, address: u64, value: u64) -> io::Result<()>;
}

/// Driver for a real `/dev/videoN` node.
pub struct V4l2Driver {
    device: Device,
    fd: RawFd,
    wake: EventFd,
    serialize: Option<Mutex<()>>,
}

impl V4l2Driver {
    /// Open the node read/write and non-blocking.
    pub fn open(path: &Path, serialize_ioctls: bool) -> io::Result<Self> {
        let device = Device::with_path(path)?;
        let fd = device.handle().fd();
        let wake =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;

        Ok(Self {
            device,
            fd,
            wake,
            serialize: serialize_ioctls.then(|| Mutex::new(())),
        })
    }

    fn guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.serialize
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Run one ioctl, restarting on EINTR.
    fn ioctl<T>(&self, mut call: impl FnMut(RawFd) -> nix::Result<T>) -> io::Result<T> {
        let _guard = self.guard();
        loop {
            match call(self.fd) {
                Err(Errno::EINTR) => continue,
                result => return result.map_err(io::Error::from),
            }
        }
    }

    fn device_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: `fd` is owned by `self.device` and stays open as long as `self`.
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl Driver for V4l2Driver {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        let _guard = self.guard();
        let caps = self.device.query_caps()?;
        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(CapFlags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(CapFlags::STREAMING),
        })
    }

    fn enum_formats(&self) -> io::Result<Vec<FourCc>> {
        let _guard = self.guard();
        let formats = self.device.enum_formats()?;
        Ok(formats.into_iter().map(|desc| desc.fourcc.into()).collect())
    }

    fn format(&self) -> io::Result<Format> {
        let _guard = self.guard();
        let fmt = self.device.format()?;
        Ok(Format::from(&fmt))
    }

    fn set_format(&self, format: &Format) -> io::Result<Format> {
        let _guard = self.guard();
        let mut fmt = self.device.format()?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();
        // Let the driver derive line and image sizes for the new geometry.
        fmt.stride = 0;
        fmt.size = 0;

        let fmt = self.device.set_format(&fmt)?;
        Ok(Format::from(&fmt))
    }

    fn set_frame_rate(&self, fps: u32) -> io::Result<()> {
        let _guard = self.guard();
        let params = self.device.set_params(&Parameters::with_fps(fps))?;
        debug!("Frame interval now {:?}", params.interval);
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut req = sys::v4l2_requestbuffers {
            count,
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: sys::V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        // SAFETY: `req` is a valid v4l2_requestbuffers for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_reqbufs(fd, &mut req) })?;
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferLayout> {
        let mut buf = sys::v4l2_buffer::capture(index);
        // SAFETY: `buf` is a valid v4l2_buffer for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_querybuf(fd, &mut buf) })?;
        Ok(BufferLayout {
            index,
            offset: buf.offset(),
            length: buf.length,
        })
    }

    fn map_buffer(&self, layout: &BufferLayout) -> io::Result<Mmap> {
        // SAFETY: the region belongs to a kernel buffer of this device; the kernel
        // only writes to it while the buffer is queued, never while it is lent out.
        unsafe {
            MmapOptions::new()
                .offset(u64::from(layout.offset))
                .len(layout.length as usize)
                .map(self.fd)
        }
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut buf = sys::v4l2_buffer::capture(index);
        // SAFETY: `buf` is a valid v4l2_buffer for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_qbuf(fd, &mut buf) })?;
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer> {
        let mut buf = sys::v4l2_buffer::capture(0);
        // SAFETY: `buf` is a valid v4l2_buffer for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_dqbuf(fd, &mut buf) })?;

        let monotonic = buf.flags & sys::V4L2_BUF_FLAG_TIMESTAMP_MASK
            == sys::V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC;
        let timestamp = monotonic.then(|| {
            Duration::from_secs(buf.timestamp.tv_sec.max(0) as u64)
                + Duration::from_micros(buf.timestamp.tv_usec.max(0) as u64)
        });

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp,
            corrupted: buf.flags & sys::V4L2_BUF_FLAG_ERROR != 0,
        })
    }

    fn stream_on(&self) -> io::Result<()> {
        let typ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        // SAFETY: `typ` outlives the call.
        self.ioctl(|fd| unsafe { sys::vidioc_streamon(fd, &typ) })?;
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let typ = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        // SAFETY: `typ` outlives the call.
        self.ioctl(|fd| unsafe { sys::vidioc_streamoff(fd, &typ) })?;
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Readiness> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let slice = match deadline {
                None => PollTimeout::NONE,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // Round up so a sub-millisecond remainder still sleeps.
                    let ms = remaining.as_micros().div_ceil(1000);
                    PollTimeout::from(ms.min(u128::from(u16::MAX)) as u16)
                }
            };

            let mut fds = [
                PollFd::new(self.device_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, slice) {
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
                Ok(0) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(Readiness::TimedOut);
                    }
                    continue;
                }
                Ok(_) => {}
            }

            let woken = fds[1]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            if woken {
                // Drain the counter so the next wait blocks again.
                let _ = self.wake.read();
                return Ok(Readiness::Interrupted);
            }

            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                return Ok(Readiness::Error);
            }
            if revents.contains(PollFlags::POLLIN) {
                return Ok(Readiness::Ready);
            }
        }
    }

    fn interrupt(&self) -> io::Result<()> {
        self.wake.write(1)?;
        Ok(())
    }

    fn query_control(&self, id: u32) -> io::Result<ControlDescriptor> {
        let mut query = sys::v4l2_queryctrl::new(id);
        // SAFETY: `query` is a valid v4l2_queryctrl for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_queryctrl(fd, &mut query) })?;
        Ok(ControlDescriptor::from(&query))
    }

    fn next_control(&self, id: u32) -> io::Result<Option<ControlDescriptor>> {
        let mut query = sys::v4l2_queryctrl::new(id | sys::V4L2_CTRL_FLAG_NEXT_CTRL);
        // SAFETY: `query` is a valid v4l2_queryctrl for the duration of the call.
        match self.ioctl(|fd| unsafe { sys::vidioc_queryctrl(fd, &mut query) }) {
            Ok(_) => Ok(Some(ControlDescriptor::from(&query))),
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn menu_item(&self, id: u32, index: u32) -> io::Result<[u8; 32]> {
        let mut menu = sys::v4l2_querymenu {
            id,
            index,
            name: [0; 32],
            reserved: 0,
        };
        // SAFETY: `menu` is a valid v4l2_querymenu for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_querymenu(fd, &mut menu) })?;
        Ok(menu.name)
    }

    fn get_control(&self, id: u32) -> io::Result<i32> {
        let mut ctrl = sys::v4l2_control { id, value: 0 };
        // SAFETY: `ctrl` is a valid v4l2_control for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_g_ctrl(fd, &mut ctrl) })?;
        Ok(ctrl.value)
    }

    fn set_control(&self, id: u32, value: i32) -> io::Result<i32> {
        let mut ctrl = sys::v4l2_control { id, value };
        // SAFETY: `ctrl` is a valid v4l2_control for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_s_ctrl(fd, &mut ctrl) })?;
        Ok(ctrl.value)
    }

    fn read_register(&self, target: &RegisterTarget, address: u64) -> io::Result<u64> {
        let mut reg = sys::v4l2_dbg_register::new(target.match_type(), target.chip, address, 0);
        // SAFETY: `reg` is a valid v4l2_dbg_register for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_dbg_g_register(fd, &mut reg) })?;
        Ok(reg.val)
    }

    fn write_register(&self, target: &RegisterTarget, address: u64, value: u64) -> io::Result<()> {
        let reg = sys::v4l2_dbg_register::new(target.match_type(), target.chip, address, value);
        // SAFETY: `reg` is a valid v4l2_dbg_register for the duration of the call.
        self.ioctl(|fd| unsafe { sys::vidioc_dbg_s_register(fd, &reg) })?;
        Ok(())
    }
}
