use thiserror::Error;

use rivulet_stun::error_code::{
    ErrorCode, CODE_BAD_REQUEST, CODE_ROLE_CONFLICT, CODE_UNAUTHORIZED,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("USERNAME attribute is missing")]
    ErrMissingUsername,
    #[error("USERNAME is not of the form remoteUfrag:localUfrag")]
    ErrInvalidUsernameFormat,
    #[error("USERNAME does not address the local ufrag")]
    ErrLocalUfragMismatch,
    #[error("MESSAGE-INTEGRITY attribute is missing")]
    ErrMissingMessageIntegrity,
    #[error("MESSAGE-INTEGRITY verification failed")]
    ErrInvalidMessageIntegrity,
    #[error("FINGERPRINT verification failed")]
    ErrFingerprintVerificationFailed,
    #[error("role conflict: both agents believe they are controlled")]
    ErrRoleConflict,
    #[error("remote credentials already set")]
    ErrRemoteCredentialsAlreadySet,
    #[error("agent is closed")]
    ErrAgentClosed,
    #[error("{0}")]
    Stun(#[from] rivulet_stun::error::Error),
}

impl Error {
    /// The STUN error code a failed connectivity check is answered with.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Error::ErrMissingUsername => Some(CODE_BAD_REQUEST),
            Error::ErrInvalidUsernameFormat => Some(CODE_BAD_REQUEST),
            Error::ErrLocalUfragMismatch => Some(CODE_UNAUTHORIZED),
            Error::ErrMissingMessageIntegrity => Some(CODE_UNAUTHORIZED),
            Error::ErrInvalidMessageIntegrity => Some(CODE_UNAUTHORIZED),
            Error::ErrFingerprintVerificationFailed => Some(CODE_BAD_REQUEST),
            Error::ErrRoleConflict => Some(CODE_ROLE_CONFLICT),
            _ => None,
        }
    }
}
