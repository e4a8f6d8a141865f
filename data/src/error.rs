use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("unexpected end of buffer: (expected: {expected}, actual: {actual})")]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },
    #[error("invalid message type {0:#04x}")]
    InvalidMessageType(u8),
    #[error("invalid channel type {0:#04x}")]
    InvalidChannelType(u8),
    #[error("data channel is closed")]
    ErrChannelClosed,
    #[error("data channel is not open yet")]
    ErrChannelNotReady,
    #[error("no stream id of the role's parity is left")]
    ErrNoFreeStreamId,
    #[error("a channel already exists on stream")]
    ErrStreamExists,
}
