//! Device controls (gain, exposure, ...) and raw ISP register access
//!
//! Control and register operations never touch the stream lock, so they can be
//! issued from another thread while a capture loop is blocked in a dequeue.

use std::fmt;
use std::io;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::capture::device::{Camera, Shared};
use crate::capture::driver::Driver;
use crate::capture::sys;
use crate::error::{CaptureError, Result};

/// V4L2 control identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlId(pub u32);

impl ControlId {
    const USER_BASE: u32 = 0x0098_0900;
    const CAMERA_BASE: u32 = 0x009a_0900;

    pub const BRIGHTNESS: Self = Self(Self::USER_BASE);
    pub const CONTRAST: Self = Self(Self::USER_BASE + 1);
    pub const SATURATION: Self = Self(Self::USER_BASE + 2);
    pub const HUE: Self = Self(Self::USER_BASE + 3);
    pub const AUTO_WHITE_BALANCE: Self = Self(Self::USER_BASE + 12);
    pub const GAMMA: Self = Self(Self::USER_BASE + 16);
    pub const EXPOSURE: Self = Self(Self::USER_BASE + 17);
    pub const AUTOGAIN: Self = Self(Self::USER_BASE + 18);
    pub const GAIN: Self = Self(Self::USER_BASE + 19);
    pub const HFLIP: Self = Self(Self::USER_BASE + 20);
    pub const VFLIP: Self = Self(Self::USER_BASE + 21);
    pub const EXPOSURE_AUTO: Self = Self(Self::CAMERA_BASE + 1);
    pub const EXPOSURE_ABSOLUTE: Self = Self(Self::CAMERA_BASE + 2);

    const NAMES: &'static [(&'static str, Self)] = &[
        ("brightness", Self::BRIGHTNESS),
        ("contrast", Self::CONTRAST),
        ("saturation", Self::SATURATION),
        ("hue", Self::HUE),
        ("auto_white_balance", Self::AUTO_WHITE_BALANCE),
        ("gamma", Self::GAMMA),
        ("exposure", Self::EXPOSURE),
        ("autogain", Self::AUTOGAIN),
        ("gain", Self::GAIN),
        ("hflip", Self::HFLIP),
        ("vflip", Self::VFLIP),
        ("exposure_auto", Self::EXPOSURE_AUTO),
        ("exposure_absolute", Self::EXPOSURE_ABSOLUTE),
    ];

    /// Resolve a well-known name (`"gain"`, `"exposure-absolute"`) or a hex id (`"0x00980913"`).
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        if let Some(hex) = normalized.strip_prefix("0x") {
            return u32::from_str_radix(hex, 16).ok().map(Self);
        }
        Self::NAMES
            .iter()
            .find(|(known, _)| *known == normalized)
            .map(|&(_, id)| id)
    }

    pub fn name(&self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(_, id)| id == self)
            .map(|&(name, _)| name)
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "0x{:08x}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Integer,
    Boolean,
    Menu,
    Button,
    Integer64,
    Class,
    String,
    Bitmask,
    IntegerMenu,
    Other(u32),
}

impl ControlKind {
    /// Kinds whose value fits the 32-bit G_CTRL/S_CTRL interface.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Integer | Self::Boolean | Self::Menu | Self::IntegerMenu | Self::Bitmask
        )
    }

    fn is_menu(&self) -> bool {
        matches!(self, Self::Menu | Self::IntegerMenu)
    }
}

impl From<u32> for ControlKind {
    fn from(raw: u32) -> Self {
        match raw {
            sys::V4L2_CTRL_TYPE_INTEGER => Self::Integer,
            sys::V4L2_CTRL_TYPE_BOOLEAN => Self::Boolean,
            sys::V4L2_CTRL_TYPE_MENU => Self::Menu,
            sys::V4L2_CTRL_TYPE_BUTTON => Self::Button,
            sys::V4L2_CTRL_TYPE_INTEGER64 => Self::Integer64,
            sys::V4L2_CTRL_TYPE_CTRL_CLASS => Self::Class,
            sys::V4L2_CTRL_TYPE_STRING => Self::String,
            sys::V4L2_CTRL_TYPE_BITMASK => Self::Bitmask,
            sys::V4L2_CTRL_TYPE_INTEGER_MENU => Self::IntegerMenu,
            other => Self::Other(other),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        const DISABLED = 0x0001;
        const GRABBED = 0x0002;
        const READ_ONLY = 0x0004;
        const UPDATE = 0x0008;
        const INACTIVE = 0x0010;
        const SLIDER = 0x0020;
        const WRITE_ONLY = 0x0040;
        const VOLATILE = 0x0080;
    }
}

/// A control as described by the driver, with its current value when readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDescriptor {
    pub id: ControlId,
    pub name: String,
    pub kind: ControlKind,
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default: i64,
    pub flags: ControlFlags,
    pub value: Option<i64>,
}

impl ControlDescriptor {
    fn readable(&self) -> bool {
        self.kind.is_scalar() && !self.flags.contains(ControlFlags::WRITE_ONLY)
    }

    fn range_checked(&self) -> bool {
        matches!(
            self.kind,
            ControlKind::Integer
                | ControlKind::Boolean
                | ControlKind::Menu
                | ControlKind::IntegerMenu
        )
    }
}

impl From<&sys::v4l2_queryctrl> for ControlDescriptor {
    fn from(query: &sys::v4l2_queryctrl) -> Self {
        Self {
            id: ControlId(query.id),
            name: sys::c_string(&query.name),
            kind: ControlKind::from(query.type_),
            minimum: i64::from(query.minimum),
            maximum: i64::from(query.maximum),
            step: u64::from(query.step.unsigned_abs()),
            default: i64::from(query.default_value),
            flags: ControlFlags::from_bits_truncate(query.flags),
            value: None,
        }
    }
}

impl fmt::Display for ControlDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {:?} [{}..={} step {}] default {}",
            self.name, self.id, self.kind, self.minimum, self.maximum, self.step, self.default
        )?;
        if let Some(value) = self.value {
            write!(f, " value {value}")?;
        }
        Ok(())
    }
}

/// One entry of a menu control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuItem {
    Name(String),
    Value(i64),
}

impl fmt::Display for MenuItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Value(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipMatch {
    /// The bridge (host) chip, i.e. the ISP itself.
    #[default]
    Bridge,
    /// A sub-device such as the sensor behind the bridge.
    Subdev,
}

/// Which chip the debug register ioctls address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterTarget {
    pub chip_match: ChipMatch,
    pub chip: u32,
}

impl RegisterTarget {
    pub(crate) fn match_type(&self) -> u32 {
        match self.chip_match {
            ChipMatch::Bridge => sys::V4L2_CHIP_MATCH_BRIDGE,
            ChipMatch::Subdev => sys::V4L2_CHIP_MATCH_SUBDEV,
        }
    }
}

/// Handle for control and register access; cheap to clone and usable from any thread.
pub struct ControlRegistry<D: Driver> {
    shared: Arc<Shared<D>>,
}

impl<D: Driver> Clone for ControlRegistry<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Driver> ControlRegistry<D> {
    pub(crate) fn new(shared: Arc<Shared<D>>) -> Self {
        Self { shared }
    }

    fn describe(&self, driver: &D, id: ControlId) -> Result<ControlDescriptor> {
        let desc = driver.query_control(id.0).map_err(|err| {
            self.shared.classify(err, |err| match err.raw_os_error() {
                Some(libc::EINVAL) => CaptureError::ControlUnsupported(id),
                _ => CaptureError::Io(err),
            })
        })?;
        if desc.flags.contains(ControlFlags::DISABLED) {
            return Err(CaptureError::ControlUnsupported(id));
        }
        Ok(desc)
    }

    /// Describe a control, including its current value when it can be read.
    pub fn query_control(&self, id: ControlId) -> Result<ControlDescriptor> {
        self.shared.with_driver(|driver| {
            let mut desc = self.describe(driver, id)?;
            if desc.readable() {
                let value = driver
                    .get_control(id.0)
                    .map_err(|err| self.shared.classify(err, CaptureError::Io))?;
                desc.value = Some(i64::from(value));
            }
            Ok(desc)
        })
    }

    pub fn get_control(&self, id: ControlId) -> Result<i64> {
        self.shared.with_driver(|driver| {
            let desc = self.describe(driver, id)?;
            if !desc.readable() {
                return Err(CaptureError::ControlUnsupported(id));
            }
            let value = driver.get_control(id.0).map_err(|err| {
                self.shared.classify(err, |err| match err.raw_os_error() {
                    Some(libc::EINVAL) | Some(libc::EACCES) => CaptureError::ControlUnsupported(id),
                    _ => CaptureError::Io(err),
                })
            })?;
            Ok(i64::from(value))
        })
    }

    /// Set a control and return the value the driver applied (it may round to the step).
    #[instrument(skip(self), fields(device = %self.shared.path))]
    pub fn set_control(&self, id: ControlId, value: i64) -> Result<i64> {
        self.shared.with_driver(|driver| {
            let desc = self.describe(driver, id)?;
            let writable = desc.kind.is_scalar() || desc.kind == ControlKind::Button;
            if !writable || desc.flags.contains(ControlFlags::READ_ONLY) {
                return Err(CaptureError::ControlUnsupported(id));
            }

            let out_of_range = CaptureError::ControlValueOutOfRange {
                id,
                value,
                minimum: desc.minimum,
                maximum: desc.maximum,
            };
            if desc.range_checked() && (value < desc.minimum || value > desc.maximum) {
                return Err(out_of_range);
            }
            let Ok(raw) = i32::try_from(value) else {
                return Err(out_of_range);
            };

            let applied = driver.set_control(id.0, raw).map_err(|err| {
                self.shared.classify(err, |err| match err.raw_os_error() {
                    Some(libc::ERANGE) | Some(libc::EINVAL) => out_of_range,
                    Some(libc::EACCES) => CaptureError::ControlUnsupported(id),
                    _ => CaptureError::Io(err),
                })
            })?;
            debug!("Control {} set to {} (requested {})", id, applied, value);
            Ok(i64::from(applied))
        })
    }

    pub fn set_gain(&self, value: i64) -> Result<i64> {
        self.set_control(ControlId::GAIN, value)
    }

    pub fn set_exposure(&self, value: i64) -> Result<i64> {
        self.set_control(ControlId::EXPOSURE, value)
    }

    /// Every control the device exposes, in driver order, with current values.
    pub fn list_controls(&self) -> Result<Vec<ControlDescriptor>> {
        self.shared.with_driver(|driver| {
            let mut controls = Vec::new();
            let mut cursor = 0u32;

            loop {
                let next = driver
                    .next_control(cursor)
                    .map_err(|err| self.shared.classify(err, CaptureError::Io))?;
                let Some(mut desc) = next else { break };
                // Ids must strictly increase or the enumeration would never end.
                if desc.id.0 <= cursor && cursor != 0 {
                    break;
                }
                cursor = desc.id.0;

                if desc.kind == ControlKind::Class || desc.flags.contains(ControlFlags::DISABLED) {
                    continue;
                }
                if desc.readable() {
                    desc.value = driver.get_control(desc.id.0).ok().map(i64::from);
                }
                controls.push(desc);
            }

            Ok(controls)
        })
    }

    /// Entries of a menu control, keyed by menu index.
    pub fn menu_items(&self, id: ControlId) -> Result<Vec<(u32, MenuItem)>> {
        self.shared.with_driver(|driver| {
            let desc = self.describe(driver, id)?;
            if !desc.kind.is_menu() {
                return Err(CaptureError::ControlUnsupported(id));
            }

            let mut items = Vec::new();
            for index in desc.minimum.max(0)..=desc.maximum.max(0) {
                let index = index as u32;
                // Drivers may skip indices inside the advertised range.
                let raw = match driver.menu_item(id.0, index) {
                    Ok(raw) => raw,
                    Err(err) if err.raw_os_error() == Some(libc::EINVAL) => continue,
                    Err(err) => return Err(self.shared.classify(err, CaptureError::Io)),
                };
                let item = if desc.kind == ControlKind::IntegerMenu {
                    let mut value = [0u8; 8];
                    value.copy_from_slice(&raw[..8]);
                    MenuItem::Value(i64::from_ne_bytes(value))
                } else {
                    MenuItem::Name(sys::c_string(&raw))
                };
                items.push((index, item));
            }

            Ok(items)
        })
    }

    /// Raw ISP register read. The value is passed through uninterpreted.
    pub fn read_register(&self, address: u64) -> Result<u64> {
        let target = self.shared.config.registers;
        self.shared.with_driver(|driver| {
            driver
                .read_register(&target, address)
                .map_err(|err| self.register_error(address, err))
        })
    }

    /// Raw ISP register write. Invalid addresses are the caller's responsibility.
    #[instrument(skip(self), fields(device = %self.shared.path))]
    pub fn write_register(&self, address: u64, value: u64) -> Result<()> {
        let target = self.shared.config.registers;
        self.shared.with_driver(|driver| {
            driver
                .write_register(&target, address, value)
                .map_err(|err| self.register_error(address, err))
        })
    }

    fn register_error(&self, address: u64, err: io::Error) -> CaptureError {
        self.shared
            .classify(err, |source| CaptureError::RegisterAccessFailed { address, source })
    }
}

impl<D: Driver> Camera<D> {
    /// Control registry sharing this camera's descriptor.
    pub fn controls(&self) -> ControlRegistry<D> {
        ControlRegistry::new(Arc::clone(&self.shared))
    }

    pub fn get_control(&self, id: ControlId) -> Result<i64> {
        self.controls().get_control(id)
    }

    pub fn set_control(&self, id: ControlId, value: i64) -> Result<i64> {
        self.controls().set_control(id, value)
    }

    pub fn read_register(&self, address: u64) -> Result<u64> {
        self.controls().read_register(address)
    }

    pub fn write_register(&self, address: u64, value: u64) -> Result<()> {
        self.controls().write_register(address, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockDriver;
    use crate::CaptureConfig;

    fn camera() -> Camera<MockDriver> {
        Camera::with_driver(MockDriver::new(), &CaptureConfig::for_device("mock0"))
            .expect("open should succeed")
    }

    #[test]
    fn test_control_id_names() {
        assert_eq!(ControlId::from_name("gain"), Some(ControlId::GAIN));
        assert_eq!(ControlId::from_name("Exposure-Absolute"), Some(ControlId::EXPOSURE_ABSOLUTE));
        assert_eq!(ControlId::from_name("0x00980913"), Some(ControlId::GAIN));
        assert_eq!(ControlId::from_name("warp_drive"), None);
        assert_eq!(ControlId::GAIN.to_string(), "gain");
        assert_eq!(ControlId(0x1234).to_string(), "0x00001234");
    }

    #[test]
    fn test_set_then_get_gain() {
        let camera = camera();
        let applied = camera.set_control(ControlId::GAIN, 50).expect("set should succeed");
        assert_eq!(applied, 50);
        assert_eq!(camera.get_control(ControlId::GAIN).expect("get should succeed"), 50);
    }

    #[test]
    fn test_set_rounds_to_step() {
        let camera = camera();
        // Mock exposure has step 10.
        let applied = camera
            .controls()
            .set_exposure(104)
            .expect("set should succeed");
        assert_eq!(applied, 100);
        assert_eq!(camera.get_control(ControlId::EXPOSURE).expect("get"), 100);
    }

    #[test]
    fn test_out_of_range_value() {
        let camera = camera();
        let err = camera.set_control(ControlId::GAIN, 500).unwrap_err();
        match err {
            CaptureError::ControlValueOutOfRange {
                id,
                value,
                minimum,
                maximum,
            } => {
                assert_eq!(id, ControlId::GAIN);
                assert_eq!(value, 500);
                assert_eq!((minimum, maximum), (0, 100));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Value unchanged.
        assert_eq!(camera.get_control(ControlId::GAIN).expect("get"), 32);
    }

    #[test]
    fn test_unsupported_control() {
        let camera = camera();
        assert!(matches!(
            camera.get_control(ControlId::HUE),
            Err(CaptureError::ControlUnsupported(ControlId::HUE))
        ));
        assert!(matches!(
            camera.set_control(ControlId::HUE, 1),
            Err(CaptureError::ControlUnsupported(_))
        ));
    }

    #[test]
    fn test_read_only_control_rejects_set() {
        let camera = camera();
        assert!(matches!(
            camera.set_control(ControlId::EXPOSURE_AUTO, 1),
            Err(CaptureError::ControlUnsupported(_))
        ));
    }

    #[test]
    fn test_list_controls_and_menu() {
        let camera = camera();
        let controls = camera.controls().list_controls().expect("list should succeed");
        let ids: Vec<ControlId> = controls.iter().map(|c| c.id).collect();
        assert_eq!(
            ids,
            vec![ControlId::EXPOSURE, ControlId::GAIN, ControlId::HFLIP, ControlId::EXPOSURE_AUTO]
        );
        assert!(controls.iter().all(|c| c.value.is_some()));

        let items = camera
            .controls()
            .menu_items(ControlId::EXPOSURE_AUTO)
            .expect("menu should succeed");
        // Index 2 is skipped by the driver.
        assert_eq!(
            items,
            vec![
                (0, MenuItem::Name("Auto Mode".to_owned())),
                (1, MenuItem::Name("Manual Mode".to_owned())),
                (3, MenuItem::Name("Aperture Priority Mode".to_owned())),
            ]
        );
    }

    #[test]
    fn test_register_round_trip() {
        let camera = camera();
        camera.write_register(0x3500, 0x7f).expect("write should succeed");
        assert_eq!(camera.read_register(0x3500).expect("read should succeed"), 0x7f);
    }

    #[test]
    fn test_register_failure() {
        let camera = camera();
        let err = camera.read_register(0xdead_0000).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::RegisterAccessFailed {
                address: 0xdead_0000,
                ..
            }
        ));
    }

    #[test]
    fn test_controls_while_streaming_from_other_thread() {
        let camera = camera();
        let controls = camera.controls();

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| controls.set_gain(75));
            let frame = camera
                .dequeue_frame(crate::capture::Wait::Timeout(std::time::Duration::from_secs(1)))
                .expect("frame");
            drop(frame);
            assert_eq!(handle.join().expect("join").expect("set"), 75);
        });
        assert_eq!(camera.get_control(ControlId::GAIN).expect("get"), 75);
    }

    #[test]
    fn test_controls_after_close() {
        let camera = camera();
        let controls = camera.controls();
        camera.close().expect("close");
        assert!(matches!(
            controls.get_control(ControlId::GAIN),
            Err(CaptureError::InvalidState(_))
        ));
    }
}
