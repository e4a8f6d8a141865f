use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const COOKIE_MAC_SIZE: usize = 32;
pub(crate) const COOKIE_PLAIN_SIZE: usize = 28;
/// Fixed wire size of a state cookie: 28 bytes of association parameters
/// plus the 32-byte HMAC-SHA256.
pub(crate) const COOKIE_SIZE: usize = COOKIE_PLAIN_SIZE + COOKIE_MAC_SIZE;

/// The replay window for an echoed cookie, in milliseconds.
pub(crate) const COOKIE_LIFETIME_MS: u64 = 60_000;

/// StateCookie captures everything the server needs to rebuild the
/// association when the peer echoes the cookie back: issue time, both
/// verification tags, the peer's initial TSN and window, and the
/// negotiated stream counts. The MAC is keyed by a per-association
/// secret, so a replayed cookie cannot bind different parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateCookie {
    pub(crate) timestamp_ms: u64,
    pub(crate) peer_tag: u32,
    pub(crate) local_tag: u32,
    pub(crate) peer_initial_tsn: u32,
    pub(crate) peer_a_rwnd: u32,
    pub(crate) num_outbound_streams: u16,
    pub(crate) num_inbound_streams: u16,
    pub(crate) mac: [u8; COOKIE_MAC_SIZE],
}

impl fmt::Display for StateCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateCookie ts={} peerTag={} localTag={} peerTSN={}",
            self.timestamp_ms, self.peer_tag, self.local_tag, self.peer_initial_tsn
        )
    }
}

fn sign(plain: &[u8], secret: &[u8]) -> [u8; COOKIE_MAC_SIZE] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(plain);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; COOKIE_MAC_SIZE];
    out.copy_from_slice(&digest);
    out
}

impl StateCookie {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        timestamp_ms: u64,
        peer_tag: u32,
        local_tag: u32,
        peer_initial_tsn: u32,
        peer_a_rwnd: u32,
        num_outbound_streams: u16,
        num_inbound_streams: u16,
        secret: &[u8],
    ) -> Self {
        let mut cookie = StateCookie {
            timestamp_ms,
            peer_tag,
            local_tag,
            peer_initial_tsn,
            peer_a_rwnd,
            num_outbound_streams,
            num_inbound_streams,
            mac: [0u8; COOKIE_MAC_SIZE],
        };
        cookie.mac = sign(&cookie.plain_bytes(), secret);
        cookie
    }

    fn plain_bytes(&self) -> [u8; COOKIE_PLAIN_SIZE] {
        let mut buf = [0u8; COOKIE_PLAIN_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        buf[8..12].copy_from_slice(&self.peer_tag.to_be_bytes());
        buf[12..16].copy_from_slice(&self.local_tag.to_be_bytes());
        buf[16..20].copy_from_slice(&self.peer_initial_tsn.to_be_bytes());
        buf[20..24].copy_from_slice(&self.peer_a_rwnd.to_be_bytes());
        buf[24..26].copy_from_slice(&self.num_outbound_streams.to_be_bytes());
        buf[26..28].copy_from_slice(&self.num_inbound_streams.to_be_bytes());
        buf
    }

    pub(crate) fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COOKIE_SIZE);
        buf.extend_from_slice(&self.plain_bytes());
        buf.extend_from_slice(&self.mac);
        buf.freeze()
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() != COOKIE_SIZE {
            return Err(Error::ErrCookieSizeInvalid);
        }

        let reader = &mut raw.clone();
        let timestamp_ms = reader.get_u64();
        let peer_tag = reader.get_u32();
        let local_tag = reader.get_u32();
        let peer_initial_tsn = reader.get_u32();
        let peer_a_rwnd = reader.get_u32();
        let num_outbound_streams = reader.get_u16();
        let num_inbound_streams = reader.get_u16();

        let mut mac = [0u8; COOKIE_MAC_SIZE];
        reader.copy_to_slice(&mut mac);

        Ok(StateCookie {
            timestamp_ms,
            peer_tag,
            local_tag,
            peer_initial_tsn,
            peer_a_rwnd,
            num_outbound_streams,
            num_inbound_streams,
            mac,
        })
    }

    /// Recomputes the MAC under `secret` and checks the issue time against
    /// the replay window. A cookie from the future is as bad as a stale
    /// one.
    pub(crate) fn verify(&self, secret: &[u8], now_ms: u64) -> Result<()> {
        let expected = sign(&self.plain_bytes(), secret);
        if expected.ct_eq(&self.mac).unwrap_u8() != 1 {
            return Err(Error::ErrCookieValidationFailed);
        }
        if now_ms < self.timestamp_ms {
            return Err(Error::ErrCookieExpired);
        }
        if now_ms - self.timestamp_ms > COOKIE_LIFETIME_MS {
            return Err(Error::ErrCookieExpired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn sample(ts: u64) -> StateCookie {
        StateCookie::new(ts, 0x1111_2222, 0x3333_4444, 1000, 131_072, 16, 16, SECRET)
    }

    #[test]
    fn test_cookie_is_sixty_bytes() {
        assert_eq!(sample(5_000).marshal().len(), 60);
    }

    #[test]
    fn test_cookie_roundtrip_and_verify() -> Result<()> {
        let cookie = sample(5_000);
        let raw = cookie.marshal();
        let decoded = StateCookie::unmarshal(&raw)?;
        assert_eq!(decoded, cookie);
        decoded.verify(SECRET, 5_500)?;
        Ok(())
    }

    #[test]
    fn test_cookie_rejects_wrong_secret() {
        let cookie = sample(5_000);
        assert_eq!(
            cookie.verify(b"another-secret-another-secret!!!", 5_500),
            Err(Error::ErrCookieValidationFailed)
        );
    }

    #[test]
    fn test_cookie_rejects_tampering() {
        let cookie = sample(5_000);
        let mut raw = cookie.marshal().to_vec();
        raw[16] ^= 0x01; // peer_initial_tsn
        let tampered = StateCookie::unmarshal(&Bytes::from(raw)).unwrap();
        assert_eq!(
            tampered.verify(SECRET, 5_500),
            Err(Error::ErrCookieValidationFailed)
        );
    }

    #[test]
    fn test_cookie_age_window() {
        let cookie = sample(100_000);
        // Exactly at issue time and at the edge of the window.
        cookie.verify(SECRET, 100_000).unwrap();
        cookie.verify(SECRET, 160_000).unwrap();
        // Beyond the window, or issued in the future.
        assert_eq!(
            cookie.verify(SECRET, 160_001),
            Err(Error::ErrCookieExpired)
        );
        assert_eq!(cookie.verify(SECRET, 99_999), Err(Error::ErrCookieExpired));
    }

    #[test]
    fn test_cookie_wrong_size() {
        assert_eq!(
            StateCookie::unmarshal(&Bytes::from_static(&[0u8; 59])),
            Err(Error::ErrCookieSizeInvalid)
        );
    }
}
