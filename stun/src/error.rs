use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("not enough data: expected {expected} bytes, got {actual}")]
    ErrInsufficientData { expected: usize, actual: usize },
    #[error("invalid message format: {0}")]
    ErrInvalidFormat(String),
    #[error("{value:#010x} is not the STUN magic cookie")]
    ErrInvalidMagicCookie { value: u32 },
    #[error("attribute not found")]
    ErrAttributeNotFound,
    #[error("attribute size is invalid")]
    ErrAttributeSizeInvalid,
    #[error("attribute size overflow")]
    ErrAttributeSizeOverflow,
    #[error("integrity check failed")]
    ErrIntegrityMismatch,
    #[error("fingerprint check failed")]
    ErrFingerprintMismatch,
    #[error("FINGERPRINT before MESSAGE-INTEGRITY attribute")]
    ErrFingerprintBeforeIntegrity,
    #[error("invalid length of IP value")]
    ErrBadIpLength,
    #[error("unsupported attribute type {0:#06x}")]
    ErrUnsupportedAttrType(u16),
}
