#![warn(rust_2018_idioms)]

pub mod channel;
pub mod error;
pub mod message;

pub use channel::{ChannelManager, ChannelRole, ChannelState, DataChannel, DcepResult};
pub use error::{Error, Result};
