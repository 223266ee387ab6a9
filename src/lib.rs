//! A user-space compute client for NVIDIA GPUs that talks to the kernel driver
//! directly, without the vendor runtime.
//!
//! The [`nv`] layer speaks the driver's ioctl protocol. The [`thunk`] layer builds
//! a usable device out of it: the object hierarchy, unified memory, channels,
//! push buffers and doorbell submission.

pub mod config;
pub mod error;
pub mod nv;
pub mod thunk;
pub mod utils;

pub use config::{GpuConfig, GpuLayout};
pub use error::{NvError, NvResult};
