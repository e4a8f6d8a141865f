
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::attributes::*;
use crate::checks::*;
use crate::error::*;
use crate::message::*;

pub const FAMILY_IPV4: u16 = 0x01;
pub const FAMILY_IPV6: u16 = 0x02;

pub const IPV4LEN: usize = 4;
pub const IPV6LEN: usize = 16;

fn xor_bytes(dst: &mut [u8], a: &[u8], b: &[u8]) {
    for (i, d) in dst.iter_mut().enumerate() {
        *d = a[i] ^ b[i];
    }
}

/// XorMappedAddress implements the XOR-MAPPED-ADDRESS attribute
/// (RFC 5389 §15.2): the port is XOR-ed with the top half of the magic
/// cookie, an IPv4 address with the cookie, and an IPv6 address with the
/// cookie concatenated with the transaction id.
pub struct XorMappedAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for XorMappedAddress {
    fn default() -> Self {
        XorMappedAddress {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

impl fmt::Display for XorMappedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(_) => write!(f, "{}:{}", self.ip, self.port),
            IpAddr::V6(_) => write!(f, "[{}]:{}", self.ip, self.port),
        }
    }
}

impl Setter for XorMappedAddress {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let (family, ip) = match self.ip {
            IpAddr::V4(v4) => (FAMILY_IPV4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (FAMILY_IPV6, v6.octets().to_vec()),
        };

        let mut xor_value = [0u8; IPV6LEN];
        xor_value[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        xor_value[4..].copy_from_slice(&m.transaction_id.0);

        let mut value = vec![0u8; 4 + ip.len()];
        value[0..2].copy_from_slice(&family.to_be_bytes());
        value[2..4].copy_from_slice(&(self.port ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        xor_bytes(&mut value[4..], &ip, &xor_value);

        m.add(ATTR_XORMAPPED_ADDRESS, &value);
        Ok(())
    }
}

impl Getter for XorMappedAddress {
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_XORMAPPED_ADDRESS)?;
        if v.len() < 4 {
            return Err(Error::ErrInsufficientData {
                expected: 4,
                actual: v.len(),
            });
        }

        let family = u16::from_be_bytes([v[0], v[1]]);
        self.port = u16::from_be_bytes([v[2], v[3]]) ^ (MAGIC_COOKIE >> 16) as u16;

        let mut xor_value = [0u8; IPV6LEN];
        xor_value[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        xor_value[4..].copy_from_slice(&m.transaction_id.0);

        match family {
            FAMILY_IPV4 => {
                check_size(ATTR_XORMAPPED_ADDRESS, v.len(), 4 + IPV4LEN)?;
                let mut ip = [0u8; IPV4LEN];
                xor_bytes(&mut ip, &v[4..], &xor_value);
                self.ip = IpAddr::V4(Ipv4Addr::from(ip));
            }
            FAMILY_IPV6 => {
                check_size(ATTR_XORMAPPED_ADDRESS, v.len(), 4 + IPV6LEN)?;
                let mut ip = [0u8; IPV6LEN];
                xor_bytes(&mut ip, &v[4..], &xor_value);
                self.ip = IpAddr::V6(Ipv6Addr::from(ip));
            }
            other => {
                return Err(Error::ErrInvalidFormat(format!(
                    "unknown address family {other:#04x}"
                )))
            }
        }

        Ok(())
    }
}
