#![warn(rust_2018_idioms)]

//! A pure Rust WebRTC data-channel stack: ICE-Lite connectivity checks,
//! an SCTP association carried over a caller-supplied DTLS transport, and
//! DCEP data channels. The stack owns no sockets and no timers; datagrams
//! come in through [`Connection::receive`], go out through the send
//! callback, and the caller drives retransmission with
//! [`Connection::drive_retransmissions`].

pub mod connection;
pub mod dtls;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod mutex;
pub mod mux;

pub use connection::{Connection, ConnectionState, DataHandler, SendFn};
pub use dtls::{Certificate, DtlsConn, DtlsEvents, DtlsFactory};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use listener::Listener;

pub use rivulet_data::{ChannelState, DataChannel};
pub use rivulet_ice::{Credentials, IceLiteState};
