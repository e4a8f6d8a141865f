#![warn(rust_2018_idioms)]

pub mod association;
pub mod chunk;
pub mod cookie;
pub mod error;
pub(crate) mod packet;
pub mod param;
pub mod queue;
pub(crate) mod util;

pub use association::{
    Association, AssociationConfig, AssociationState, PacketResult, ReceivedMessage,
};
pub use chunk::chunk_payload_data::PayloadProtocolIdentifier;
pub use error::{Error, Result};
