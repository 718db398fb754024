//! In-memory driver for exercising the capture core without hardware.
//!
//! Buffers are temp files mapped the same way the kernel's would be, so frames
//! handed out by `Camera<MockDriver>` are real mappings.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::ops::Bound;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapOptions};

use crate::capture::controls::{ControlDescriptor, ControlId, RegisterTarget};
use crate::capture::driver::{BufferLayout, DequeuedBuffer, DeviceCapabilities, Driver, Readiness};
use crate::capture::format::{FourCc, Format};
use crate::capture::sys;

const PAGE: u32 = 4096;

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

struct MockControl {
    query: sys::v4l2_queryctrl,
    value: i32,
    menu: Vec<(u32, &'static str)>,
}

impl MockControl {
    fn new(id: u32, kind: u32, name: &str, range: (i32, i32, i32), default: i32) -> Self {
        let mut query = sys::v4l2_queryctrl::new(id);
        query.type_ = kind;
        query.name[..name.len()].copy_from_slice(name.as_bytes());
        (query.minimum, query.maximum, query.step) = range;
        query.default_value = default;
        Self {
            query,
            value: default,
            menu: Vec::new(),
        }
    }

    fn flags(mut self, flags: u32) -> Self {
        self.query.flags = flags;
        self
    }

    fn menu(mut self, items: &[(u32, &'static str)]) -> Self {
        self.menu = items.to_vec();
        self
    }
}

struct MockState {
    capabilities: DeviceCapabilities,
    formats: Vec<FourCc>,
    format: Format,
    stride_alignment: u32,

    buffers: Vec<File>,
    buffer_len: u32,
    queued: VecDeque<u32>,
    done: VecDeque<DequeuedBuffer>,
    streaming: bool,
    interrupted: bool,
    lost: bool,
    sequence: u32,

    auto: bool,
    timestamps: bool,
    max_buffers: u32,
    fail_stream_on: bool,
    fail_map_at: Option<u32>,

    controls: BTreeMap<u32, MockControl>,
    registers: HashMap<u64, u64>,
}

impl MockState {
    fn check_present(&self) -> io::Result<()> {
        if self.lost {
            return Err(errno(libc::ENODEV));
        }
        Ok(())
    }

    /// Move the oldest queued buffer to the done queue, filled with its sequence number.
    fn fill_next(&mut self, corrupted: bool) -> bool {
        let Some(index) = self.queued.pop_front() else {
            return false;
        };
        let sequence = self.sequence;
        self.sequence += 1;

        let image = vec![sequence as u8; self.format.size as usize];
        if let Some(file) = self.buffers.get(index as usize) {
            // Test scaffolding; a failed write shows up as wrong pixel data.
            let _ = file.write_all_at(&image, 0);
        }

        self.done.push_back(DequeuedBuffer {
            index,
            bytes_used: self.format.size,
            sequence,
            timestamp: self
                .timestamps
                .then(|| Duration::from_millis(1 + 33 * u64::from(sequence))),
            corrupted,
        });
        true
    }
}

struct Inner {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

/// Fake V4L2 device: YUYV or GREY up to 1920x1080, a handful of controls and a
/// register file. Frames are produced on demand unless switched to `manual()`.
pub struct MockDriver {
    inner: Arc<Inner>,
}

/// Test-side handle onto a `MockDriver` that has been moved into a `Camera`.
#[derive(Clone)]
pub struct MockProbe {
    inner: Arc<Inner>,
}

impl MockDriver {
    pub fn new() -> Self {
        let capabilities = DeviceCapabilities {
            driver: "mock".to_owned(),
            card: "Mock Camera".to_owned(),
            bus_info: "mock:0".to_owned(),
            can_capture: true,
            can_stream: true,
        };

        let user_class = 0x0098_0001;
        let controls = [
            MockControl::new(
                user_class,
                sys::V4L2_CTRL_TYPE_CTRL_CLASS,
                "User Controls",
                (0, 0, 0),
                0,
            )
            .flags(0x44),
            MockControl::new(
                ControlId::EXPOSURE.0,
                sys::V4L2_CTRL_TYPE_INTEGER,
                "Exposure",
                (0, 1000, 10),
                100,
            ),
            MockControl::new(
                ControlId::GAIN.0,
                sys::V4L2_CTRL_TYPE_INTEGER,
                "Gain",
                (0, 100, 1),
                32,
            )
            .flags(0x20),
            MockControl::new(
                ControlId::HFLIP.0,
                sys::V4L2_CTRL_TYPE_BOOLEAN,
                "Horizontal Flip",
                (0, 1, 1),
                0,
            ),
            MockControl::new(
                ControlId::EXPOSURE_AUTO.0,
                sys::V4L2_CTRL_TYPE_MENU,
                "Auto Exposure",
                (0, 3, 1),
                1,
            )
            .flags(0x04)
            .menu(&[(0, "Auto Mode"), (1, "Manual Mode"), (3, "Aperture Priority Mode")]),
        ];

        let state = MockState {
            capabilities,
            formats: vec![FourCc::YUYV, FourCc::GREY],
            format: Format::packed(640, 480, FourCc::YUYV),
            stride_alignment: 1,
            buffers: Vec::new(),
            buffer_len: 0,
            queued: VecDeque::new(),
            done: VecDeque::new(),
            streaming: false,
            interrupted: false,
            lost: false,
            sequence: 0,
            auto: true,
            timestamps: true,
            max_buffers: 32,
            fail_stream_on: false,
            fail_map_at: None,
            controls: controls.into_iter().map(|c| (c.query.id, c)).collect(),
            registers: HashMap::new(),
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        }
    }

    fn configure(self, f: impl FnOnce(&mut MockState)) -> Self {
        f(&mut self.inner.lock());
        self
    }

    /// Frames only arrive through `MockProbe::produce`.
    pub fn manual(self) -> Self {
        self.configure(|s| s.auto = false)
    }

    pub fn with_max_buffers(self, max: u32) -> Self {
        self.configure(|s| s.max_buffers = max)
    }

    pub fn with_map_failure_at(self, index: u32) -> Self {
        self.configure(|s| s.fail_map_at = Some(index))
    }

    pub fn with_stream_on_failure(self) -> Self {
        self.configure(|s| s.fail_stream_on = true)
    }

    /// Pad each line to a multiple of `alignment` bytes.
    pub fn with_stride_alignment(self, alignment: u32) -> Self {
        self.configure(|s| s.stride_alignment = alignment.max(1))
    }

    pub fn without_timestamps(self) -> Self {
        self.configure(|s| s.timestamps = false)
    }

    pub fn without_capture(self) -> Self {
        self.configure(|s| s.capabilities.can_capture = false)
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MockProbe {
    /// Kernel buffers currently allocated.
    pub fn allocated(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    /// Buffers queued and not yet filled.
    pub fn queued(&self) -> usize {
        self.inner.lock().queued.len()
    }

    pub fn streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    pub fn control(&self, id: ControlId) -> Option<i64> {
        self.inner.lock().controls.get(&id.0).map(|c| i64::from(c.value))
    }

    /// Fill the next queued buffer. Returns `false` when none is queued.
    pub fn produce(&self) -> bool {
        let filled = self.inner.lock().fill_next(false);
        self.inner.changed.notify_all();
        filled
    }

    pub fn produce_corrupted(&self) -> bool {
        let filled = self.inner.lock().fill_next(true);
        self.inner.changed.notify_all();
        filled
    }

    /// Simulate the device being unplugged.
    pub fn disconnect(&self) {
        self.inner.lock().lost = true;
        self.inner.changed.notify_all();
    }
}

impl Driver for MockDriver {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        let state = self.inner.lock();
        state.check_present()?;
        Ok(state.capabilities.clone())
    }

    fn enum_formats(&self) -> io::Result<Vec<FourCc>> {
        Ok(self.inner.lock().formats.clone())
    }

    fn format(&self) -> io::Result<Format> {
        Ok(self.inner.lock().format)
    }

    fn set_format(&self, format: &Format) -> io::Result<Format> {
        let mut state = self.inner.lock();
        state.check_present()?;
        if !state.buffers.is_empty() {
            return Err(errno(libc::EBUSY));
        }
        if !state.formats.contains(&format.fourcc) {
            return Err(errno(libc::EINVAL));
        }

        let width = format.width.clamp(16, 1920);
        let height = format.height.clamp(16, 1080);
        let line = width * format.fourcc.bytes_per_pixel().unwrap_or(1);
        let stride = line.div_ceil(state.stride_alignment) * state.stride_alignment;
        state.format = Format {
            width,
            height,
            fourcc: format.fourcc,
            stride,
            size: stride * height,
        };
        Ok(state.format)
    }

    fn set_frame_rate(&self, _fps: u32) -> io::Result<()> {
        Ok(())
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut state = self.inner.lock();
        if state.streaming {
            return Err(errno(libc::EBUSY));
        }
        state.buffers.clear();
        state.queued.clear();
        state.done.clear();
        state.check_present()?;
        if count == 0 {
            return Ok(0);
        }

        let granted = count.min(state.max_buffers);
        let length = state.format.size.div_ceil(PAGE) * PAGE;
        for _ in 0..granted {
            let file = tempfile::tempfile()?;
            file.set_len(u64::from(length))?;
            state.buffers.push(file);
        }
        state.buffer_len = length;
        Ok(granted)
    }

    fn query_buffer(&self, index: u32) -> io::Result<BufferLayout> {
        let state = self.inner.lock();
        if index as usize >= state.buffers.len() {
            return Err(errno(libc::EINVAL));
        }
        Ok(BufferLayout {
            index,
            offset: index * state.buffer_len,
            length: state.buffer_len,
        })
    }

    fn map_buffer(&self, layout: &BufferLayout) -> io::Result<Mmap> {
        let state = self.inner.lock();
        if state.fail_map_at == Some(layout.index) {
            return Err(errno(libc::ENOMEM));
        }
        let file = state
            .buffers
            .get(layout.index as usize)
            .ok_or_else(|| errno(libc::EINVAL))?;
        unsafe { MmapOptions::new().len(layout.length as usize).map(file) }
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut state = self.inner.lock();
        state.check_present()?;
        if index as usize >= state.buffers.len()
            || state.queued.contains(&index)
            || state.done.iter().any(|b| b.index == index)
        {
            return Err(errno(libc::EINVAL));
        }
        state.queued.push_back(index);
        drop(state);
        self.inner.changed.notify_all();
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<DequeuedBuffer> {
        let mut state = self.inner.lock();
        state.check_present()?;
        if !state.streaming {
            return Err(errno(libc::EINVAL));
        }
        if state.done.is_empty() && state.auto {
            state.fill_next(false);
        }
        state.done.pop_front().ok_or_else(|| errno(libc::EAGAIN))
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut state = self.inner.lock();
        state.check_present()?;
        if state.fail_stream_on {
            return Err(errno(libc::EIO));
        }
        if state.buffers.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut state = self.inner.lock();
        state.streaming = false;
        state.queued.clear();
        state.done.clear();
        let present = state.check_present();
        drop(state);
        self.inner.changed.notify_all();
        present
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Readiness> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.lock();

        loop {
            if state.interrupted {
                state.interrupted = false;
                return Ok(Readiness::Interrupted);
            }
            if state.lost || !state.streaming {
                return Ok(Readiness::Error);
            }
            if !state.done.is_empty() || (state.auto && !state.queued.is_empty()) {
                return Ok(Readiness::Ready);
            }
            // Like vb2: nothing queued and nothing done is an error condition.
            if state.queued.is_empty() {
                return Ok(Readiness::Error);
            }

            state = match deadline {
                None => self.inner.changed.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Readiness::TimedOut);
                    }
                    self.inner.changed.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }

    fn interrupt(&self) -> io::Result<()> {
        self.inner.lock().interrupted = true;
        self.inner.changed.notify_all();
        Ok(())
    }

    fn query_control(&self, id: u32) -> io::Result<ControlDescriptor> {
        let state = self.inner.lock();
        state.check_present()?;
        state
            .controls
            .get(&id)
            .map(|c| ControlDescriptor::from(&c.query))
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn next_control(&self, id: u32) -> io::Result<Option<ControlDescriptor>> {
        let state = self.inner.lock();
        state.check_present()?;
        let lower = if id == 0 { Bound::Unbounded } else { Bound::Excluded(id) };
        Ok(state
            .controls
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(_, c)| ControlDescriptor::from(&c.query)))
    }

    fn menu_item(&self, id: u32, index: u32) -> io::Result<[u8; 32]> {
        let state = self.inner.lock();
        let name = state
            .controls
            .get(&id)
            .and_then(|c| c.menu.iter().find(|(i, _)| *i == index))
            .map(|(_, name)| *name)
            .ok_or_else(|| errno(libc::EINVAL))?;
        let mut raw = [0u8; 32];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        Ok(raw)
    }

    fn get_control(&self, id: u32) -> io::Result<i32> {
        let state = self.inner.lock();
        state.check_present()?;
        state
            .controls
            .get(&id)
            .map(|c| c.value)
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn set_control(&self, id: u32, value: i32) -> io::Result<i32> {
        let mut state = self.inner.lock();
        state.check_present()?;
        let control = state.controls.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))?;
        let q = control.query;
        if q.flags & 0x04 != 0 {
            return Err(errno(libc::EACCES));
        }
        if value < q.minimum || value > q.maximum {
            return Err(errno(libc::ERANGE));
        }
        let step = q.step.max(1);
        let snapped = q.minimum + (value - q.minimum + step / 2) / step * step;
        control.value = snapped.min(q.maximum);
        Ok(control.value)
    }

    fn read_register(&self, _target: &RegisterTarget, address: u64) -> io::Result<u64> {
        let state = self.inner.lock();
        state.check_present()?;
        if address > 0xffff {
            return Err(errno(libc::EINVAL));
        }
        Ok(state.registers.get(&address).copied().unwrap_or(0))
    }

    fn write_register(&self, _target: &RegisterTarget, address: u64, value: u64) -> io::Result<()> {
        let mut state = self.inner.lock();
        state.check_present()?;
        if address > 0xffff {
            return Err(errno(libc::EINVAL));
        }
        state.registers.insert(address, value);
        Ok(())
    }
}
