//! Kernel ABI for the buffer queue, control and debug-register ioctls.
//!
//! The v4l crate covers capabilities and formats; the streaming I/O and
//! register calls below are issued directly. Layouts follow
//! `include/uapi/linux/videodev2.h`.

#![allow(non_camel_case_types)]

use std::os::raw::{c_int, c_ulong, c_void};

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;

pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const V4L2_BUF_FLAG_TIMESTAMP_MASK: u32 = 0x0000_e000;
pub const V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC: u32 = 0x0000_2000;

pub const V4L2_CTRL_FLAG_NEXT_CTRL: u32 = 0x8000_0000;

pub const V4L2_CTRL_TYPE_INTEGER: u32 = 1;
pub const V4L2_CTRL_TYPE_BOOLEAN: u32 = 2;
pub const V4L2_CTRL_TYPE_MENU: u32 = 3;
pub const V4L2_CTRL_TYPE_BUTTON: u32 = 4;
pub const V4L2_CTRL_TYPE_INTEGER64: u32 = 5;
pub const V4L2_CTRL_TYPE_CTRL_CLASS: u32 = 6;
pub const V4L2_CTRL_TYPE_STRING: u32 = 7;
pub const V4L2_CTRL_TYPE_BITMASK: u32 = 8;
pub const V4L2_CTRL_TYPE_INTEGER_MENU: u32 = 9;

pub const V4L2_CHIP_MATCH_BRIDGE: u32 = 0;
pub const V4L2_CHIP_MATCH_SUBDEV: u32 = 4;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl v4l2_buffer {
    /// A zeroed mmap capture buffer descriptor for `index`.
    pub fn capture(index: u32) -> Self {
        Self {
            index,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            bytesused: 0,
            flags: 0,
            field: 0,
            timestamp: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            timecode: v4l2_timecode::default(),
            sequence: 0,
            memory: V4L2_MEMORY_MMAP,
            m: v4l2_buffer_m { userptr: 0 },
            length: 0,
            reserved2: 0,
            request_fd: 0,
        }
    }

    pub fn offset(&self) -> u32 {
        // SAFETY: for V4L2_MEMORY_MMAP the kernel fills the `offset` member.
        unsafe { self.m.offset }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct v4l2_queryctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

impl v4l2_queryctrl {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            type_: 0,
            name: [0; 32],
            minimum: 0,
            maximum: 0,
            step: 0,
            default_value: 0,
            flags: 0,
            reserved: [0; 2],
        }
    }
}

/// `name` doubles as the `__s64 value` of integer menus (first eight bytes).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct v4l2_querymenu {
    pub id: u32,
    pub index: u32,
    pub name: [u8; 32],
    pub reserved: u32,
}

/// `addr` doubles as `name[32]` in the kernel union.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct v4l2_dbg_match {
    pub type_: u32,
    pub addr: [u8; 32],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct v4l2_dbg_register {
    pub match_: v4l2_dbg_match,
    pub size: u32,
    pub reg: u64,
    pub val: u64,
}

impl v4l2_dbg_register {
    pub fn new(match_type: u32, chip: u32, reg: u64, val: u64) -> Self {
        let mut addr = [0u8; 32];
        addr[..4].copy_from_slice(&chip.to_ne_bytes());
        Self {
            match_: v4l2_dbg_match {
                type_: match_type,
                addr,
            },
            size: 0,
            reg,
            val,
        }
    }
}

/// NUL-terminated fixed-size kernel string to `String`.
pub fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

const VIDIOC_MAGIC: u8 = b'V';

nix::ioctl_readwrite!(vidioc_reqbufs, VIDIOC_MAGIC, 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, VIDIOC_MAGIC, 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, VIDIOC_MAGIC, 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, VIDIOC_MAGIC, 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, VIDIOC_MAGIC, 18, c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, VIDIOC_MAGIC, 19, c_int);
nix::ioctl_readwrite!(vidioc_g_ctrl, VIDIOC_MAGIC, 27, v4l2_control);
nix::ioctl_readwrite!(vidioc_s_ctrl, VIDIOC_MAGIC, 28, v4l2_control);
nix::ioctl_readwrite!(vidioc_queryctrl, VIDIOC_MAGIC, 36, v4l2_queryctrl);
nix::ioctl_readwrite!(vidioc_querymenu, VIDIOC_MAGIC, 37, v4l2_querymenu);
nix::ioctl_write_ptr!(vidioc_dbg_s_register, VIDIOC_MAGIC, 79, v4l2_dbg_register);
nix::ioctl_readwrite!(vidioc_dbg_g_register, VIDIOC_MAGIC, 80, v4l2_dbg_register);
