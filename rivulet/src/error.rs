use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("connection failed: {0}")]
    ErrConnectionFailed(String),
    #[error("DTLS handshake failed: {0}")]
    ErrDtlsHandshakeFailed(String),
    #[error("remote certificate fingerprint does not match the expected value")]
    ErrFingerprintMismatch,
    #[error("operation invalid in state {0}")]
    ErrInvalidState(String),
    #[error("connection is closed")]
    ErrClosed,
    #[error("data channel is not open")]
    ErrChannelNotOpen,
    #[error("endpoint is closed")]
    ErrEndpointClosed,
    #[error("listener is closed")]
    ErrListenerClosed,
    #[error("ice: {0}")]
    Ice(#[from] rivulet_ice::error::Error),
    #[error("sctp: {0}")]
    Sctp(#[from] rivulet_sctp::Error),
    #[error("dcep: {0}")]
    Data(#[from] rivulet_data::Error),
}
