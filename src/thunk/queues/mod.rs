pub mod channel;
pub mod pushbuf;
pub mod qmd;
pub mod submit;

pub use channel::{Channel, ChannelBuilder, ChannelHandles};
pub use pushbuf::{COMPUTE_SUBCHANNEL, Opcode, PacketHeader, PushBuffer};
pub use qmd::{LaunchParams, Qmd, QmdField};
pub use submit::{CompletionStatus, ControlBlock, PollOptions};
