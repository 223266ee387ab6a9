//! Driver-facing layer: parameter block layouts, the raw control channel, and the
//! resource manager client built on it.

pub mod codec;
pub mod device;
pub mod ioctl;
pub mod rm;

#[cfg(test)]
pub(crate) mod mock;

pub use device::{ControlChannel, ControlChannelExt, DeviceNode, NvDevice};
pub use ioctl::Handle;
pub use rm::RmClient;
