//! LIFX-style LAN protocol core.
//! No I/O: targets, message templates, the wire codec, retry schedules and
//! per-session correlation state.

pub mod protocol;
pub mod retry;
pub mod session;
pub mod target;
pub mod wire;

pub use protocol::{Expect, Header, Message, Packet, Payload, Service, DEFAULT_PORT, PROTOCOL};
pub use retry::{RetryGaps, RetrySchedule};
pub use session::SessionContext;
pub use target::{parse_serials, Target, TargetError};
pub use wire::{Codec, FrameCodec, FrameDecodeError, FrameEncodeError};
