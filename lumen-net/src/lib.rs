//! Transport dispatch engine: discovers devices, writes packets with retries,
//! correlates replies and streams them back.

pub mod catcher;
pub mod config;
mod discovery;
pub mod error;
pub mod fake;
pub mod found;
pub mod item;
pub mod options;
pub mod receiver;
pub mod reference;
pub mod result;
pub mod script;
pub mod sender;
pub mod socket;
pub mod streamer;
pub mod ticker;
pub mod transport;
pub mod writer;

pub use catcher::{CatchScope, CaughtErrors, ErrorCatcher};
pub use config::{Config, ConfigError, DiscoveryOptions};
pub use error::{BadRunWithResults, DispatchError};
pub use found::Found;
pub use item::{Item, ReplyStream};
pub use options::{Broadcast, FindOptions, SendOptions, SingleOptions};
pub use receiver::Receiver;
pub use reference::{FoundSerials, HardCodedSerials, Reference, SerialsFromFile, SpecialReference};
pub use result::Reply;
pub use script::{Pipeline, Repeater, Script};
pub use sender::{Sender, WeakSender};
pub use socket::{DatagramSocket, UdpSocketIo};
pub use streamer::{Limit, ResultStreamer, StreamResult};
pub use transport::{Transport, UdpTransport};
