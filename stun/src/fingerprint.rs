
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::attributes::*;
use crate::checks::*;
use crate::error::*;
use crate::message::*;

/// FingerprintAttr represents the FINGERPRINT attribute (RFC 5389 §15.5).
pub struct FingerprintAttr;

pub const FINGERPRINT: FingerprintAttr = FingerprintAttr {};

pub const FINGERPRINT_XOR_VALUE: u32 = 0x5354_554E;
pub const FINGERPRINT_SIZE: usize = 4;

const ISO_HDLC_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of the message up to the FINGERPRINT attribute, XOR-ed with
/// 0x5354554E so a payload that also carries a CRC-32 cannot collide.
pub fn fingerprint_value(b: &[u8]) -> u32 {
    ISO_HDLC_CRC.checksum(b) ^ FINGERPRINT_XOR_VALUE
}

impl Setter for FingerprintAttr {
    /// Appends FINGERPRINT; the header length is adjusted to cover the
    /// fingerprint TLV before the checksum runs. Must be the last
    /// attribute added.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let length = m.length;
        m.length += (ATTRIBUTE_HEADER_SIZE + FINGERPRINT_SIZE) as u32;
        m.write_length();
        let value = fingerprint_value(&m.raw);
        m.length = length;
        m.add(ATTR_FINGERPRINT, &value.to_be_bytes());
        Ok(())
    }
}

impl FingerprintAttr {
    /// Recomputes the checksum over everything before the fingerprint
    /// attribute and compares.
    pub fn check(&self, m: &Message) -> Result<()> {
        let b = m.get(ATTR_FINGERPRINT)?;
        check_size(ATTR_FINGERPRINT, b.len(), FINGERPRINT_SIZE)?;

        let got = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let attr_start = m.raw.len() - (ATTRIBUTE_HEADER_SIZE + FINGERPRINT_SIZE);
        let expected = fingerprint_value(&m.raw[..attr_start]);
        check_fingerprint(got, expected)
    }
}
