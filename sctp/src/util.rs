use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};

pub(crate) const PADDING_MULTIPLE: usize = 4;

pub(crate) fn get_padding_size(len: usize) -> usize {
    (PADDING_MULTIPLE - (len % PADDING_MULTIPLE)) % PADDING_MULTIPLE
}

/// Shared zeroes standing in for the checksum field so the packet never
/// has to be copied just to blank four bytes.
pub(crate) static FOUR_ZEROES: Bytes = Bytes::from_static(&[0, 0, 0, 0]);

/// CRC-32C (Castagnoli), table-driven.
pub(crate) const ISCSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum of a full packet with the checksum field treated as zero.
pub(crate) fn generate_packet_checksum(raw: &Bytes) -> u32 {
    let mut digest = ISCSI_CRC.digest();
    digest.update(&raw[0..8]);
    digest.update(&FOUR_ZEROES[..]);
    digest.update(&raw[12..]);
    digest.finalize()
}

// Serial Number Arithmetic (RFC 1982): a < b iff the signed 32-bit
// difference a - b is negative.
#[inline]
pub(crate) fn sna32lt(i1: u32, i2: u32) -> bool {
    (i1.wrapping_sub(i2) as i32) < 0
}

#[inline]
pub(crate) fn sna32lte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32lt(i1, i2)
}

#[inline]
pub(crate) fn sna32gt(i1: u32, i2: u32) -> bool {
    sna32lt(i2, i1)
}

#[inline]
pub(crate) fn sna32gte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32gt(i1, i2)
}

#[inline]
pub(crate) fn sna16lt(i1: u16, i2: u16) -> bool {
    (i1.wrapping_sub(i2) as i16) < 0
}

#[inline]
pub(crate) fn sna16gt(i1: u16, i2: u16) -> bool {
    sna16lt(i2, i1)
}
