//! Device bring-up and command submission on top of the raw driver layer.

pub mod context;
pub mod host;
pub mod memory;
pub mod queues;

pub use context::{ContextHandles, DeviceContext, GpuUuid, SmIssueRateModifiers};
pub use host::{HostProgram, ProgramArg};
