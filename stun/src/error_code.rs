use std::fmt;

use crate::attributes::*;
use crate::checks::*;
use crate::error::*;
use crate::message::*;

/// ErrorCodeAttribute represents the ERROR-CODE attribute (RFC 5389 §15.6).
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct ErrorCodeAttribute {
    pub code: ErrorCode,
    pub reason: Vec<u8>,
}

impl fmt::Display for ErrorCodeAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.0, String::from_utf8_lossy(&self.reason))
    }
}

const ERROR_CODE_CLASS_BYTE: usize = 2;
const ERROR_CODE_NUMBER_BYTE: usize = 3;
const ERROR_CODE_REASON_START: usize = 4;
const ERROR_CODE_REASON_MAX_B: usize = 763;
const ERROR_CODE_MODULO: u16 = 100;

impl Setter for ErrorCodeAttribute {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        check_overflow(ATTR_ERROR_CODE, self.reason.len(), ERROR_CODE_REASON_MAX_B)?;

        let mut value = Vec::with_capacity(ERROR_CODE_REASON_START + self.reason.len());
        value.extend_from_slice(&[0, 0]);
        value.push((self.code.0 / ERROR_CODE_MODULO) as u8);
        value.push((self.code.0 % ERROR_CODE_MODULO) as u8);
        value.extend_from_slice(&self.reason);

        m.add(ATTR_ERROR_CODE, &value);
        Ok(())
    }
}

impl Getter for ErrorCodeAttribute {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_ERROR_CODE)?;
        if v.len() < ERROR_CODE_REASON_START {
            return Err(Error::ErrInsufficientData {
                expected: ERROR_CODE_REASON_START,
                actual: v.len(),
            });
        }

        let class = v[ERROR_CODE_CLASS_BYTE] as u16;
        let number = v[ERROR_CODE_NUMBER_BYTE] as u16;
        self.code = ErrorCode(class * ERROR_CODE_MODULO + number);
        self.reason = v[ERROR_CODE_REASON_START..].to_vec();
        Ok(())
    }
}

/// ErrorCode is the numeric code carried by ERROR-CODE.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Default, Debug)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub fn default_reason(&self) -> Option<&'static str> {
        match *self {
            CODE_TRY_ALTERNATE => Some("Try Alternate"),
            CODE_BAD_REQUEST => Some("Bad Request"),
            CODE_UNAUTHORIZED => Some("Unauthorized"),
            CODE_UNKNOWN_ATTRIBUTE => Some("Unknown Attribute"),
            CODE_STALE_NONCE => Some("Stale Nonce"),
            CODE_ROLE_CONFLICT => Some("Role Conflict"),
            CODE_SERVER_ERROR => Some("Server Error"),
            _ => None,
        }
    }
}

impl Setter for ErrorCode {
    /// Adds ERROR-CODE with its default reason phrase.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let reason = self.default_reason().ok_or_else(|| {
            Error::ErrInvalidFormat(format!("no default reason for error code {}", self.0))
        })?;
        ErrorCodeAttribute {
            code: *self,
            reason: reason.as_bytes().to_vec(),
        }
        .add_to(m)
    }
}

pub const CODE_TRY_ALTERNATE: ErrorCode = ErrorCode(300);
pub const CODE_BAD_REQUEST: ErrorCode = ErrorCode(400);
pub const CODE_UNAUTHORIZED: ErrorCode = ErrorCode(401);
pub const CODE_UNKNOWN_ATTRIBUTE: ErrorCode = ErrorCode(420);
pub const CODE_STALE_NONCE: ErrorCode = ErrorCode(438);
pub const CODE_ROLE_CONFLICT: ErrorCode = ErrorCode(487);
pub const CODE_SERVER_ERROR: ErrorCode = ErrorCode(500);
