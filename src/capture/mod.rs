pub mod controls;
pub mod device;
pub mod driver;
pub mod format;
pub mod frame;
pub mod pool;
pub mod session;
pub mod sys;

#[cfg(test)]
pub(crate) mod mock;

pub use controls::{
    ChipMatch, ControlDescriptor, ControlFlags, ControlId, ControlKind, ControlRegistry, MenuItem,
    RegisterTarget,
};
pub use device::Camera;
pub use driver::{DeviceCapabilities, Driver, V4l2Driver};
pub use format::{FourCc, Format, FormatRequest};
pub use frame::{Frame, FrameMetadata};
pub use pool::BufferState;
pub use session::{SessionState, Wait};
