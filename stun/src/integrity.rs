
use std::fmt;

use ring::hmac;

use crate::attributes::*;
use crate::checks::*;
use crate::error::*;
use crate::message::*;

pub const MESSAGE_INTEGRITY_SIZE: usize = 20;

/// MessageIntegrity holds the HMAC-SHA1 key for the MESSAGE-INTEGRITY
/// attribute (RFC 5389 §15.4). For short-term credentials the key is the
/// UTF-8 password.
#[derive(Default, Clone)]
pub struct MessageIntegrity(pub Vec<u8>);

fn new_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
    hmac::sign(&key, message).as_ref().to_vec()
}

impl fmt::Display for MessageIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KEY: 0x{:x?}", self.0)
    }
}

/// Outcome of verifying MESSAGE-INTEGRITY on a received message.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum IntegrityResult {
    Valid,
    Invalid,
    Missing,
}

impl Setter for MessageIntegrity {
    /// Appends MESSAGE-INTEGRITY, HMAC-ing the message with its header
    /// length adjusted to cover the integrity TLV itself.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        // FINGERPRINT is computed over the integrity attribute and must
        // come after it.
        if m.contains(ATTR_FINGERPRINT) {
            return Err(Error::ErrFingerprintBeforeIntegrity);
        }

        let length = m.length;
        m.length += (ATTRIBUTE_HEADER_SIZE + MESSAGE_INTEGRITY_SIZE) as u32;
        m.write_length();
        let v = new_hmac(&self.0, &m.raw);
        m.length = length;

        m.add(ATTR_MESSAGE_INTEGRITY, &v);
        Ok(())
    }
}

impl MessageIntegrity {
    /// Key for short-term credentials: the raw password bytes.
    pub fn new_short_term_integrity(password: &str) -> Self {
        MessageIntegrity(password.as_bytes().to_vec())
    }

    /// Checks MESSAGE-INTEGRITY, reproducing the length adjustment the
    /// sender made: attributes after the integrity TLV (i.e. FINGERPRINT)
    /// are subtracted from the header length before the HMAC is computed.
    pub fn check(&self, m: &mut Message) -> Result<()> {
        let v = m.get(ATTR_MESSAGE_INTEGRITY)?;
        check_size(ATTR_MESSAGE_INTEGRITY, v.len(), MESSAGE_INTEGRITY_SIZE)?;

        let length = m.length;
        let mut after_integrity = false;
        let mut size_reduced = 0usize;
        for a in &m.attributes.0 {
            if after_integrity {
                size_reduced += ATTRIBUTE_HEADER_SIZE + nearest_padded_value_length(a.length as usize);
            }
            if a.typ == ATTR_MESSAGE_INTEGRITY {
                after_integrity = true;
            }
        }

        m.length -= size_reduced as u32;
        m.write_length();
        let start_of_hmac = MESSAGE_HEADER_SIZE + m.length as usize
            - (ATTRIBUTE_HEADER_SIZE + MESSAGE_INTEGRITY_SIZE);
        let expected = new_hmac(&self.0, &m.raw[..start_of_hmac]);
        m.length = length;
        m.write_length();

        check_hmac(&v, &expected)
    }

    /// Tri-state verification for callers that need missing and invalid
    /// as distinct outcomes.
    pub fn verify(&self, m: &mut Message) -> IntegrityResult {
        if !m.contains(ATTR_MESSAGE_INTEGRITY) {
            return IntegrityResult::Missing;
        }
        match self.check(m) {
            Ok(()) => IntegrityResult::Valid,
            Err(_) => IntegrityResult::Invalid,
        }
    }
}
