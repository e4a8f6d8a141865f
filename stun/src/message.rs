
use std::fmt;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::Rng;

use crate::attributes::*;
use crate::error::*;

/// The fixed value distinguishing STUN packets from other protocols
/// multiplexed on the same port, in network byte order (RFC 5389 §6).
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

pub const MESSAGE_HEADER_SIZE: usize = 20;
pub const ATTRIBUTE_HEADER_SIZE: usize = 4;
pub const TRANSACTION_ID_SIZE: usize = 12;

/// Setter writes itself into a message as one or more attributes.
pub trait Setter {
    fn add_to(&self, m: &mut Message) -> Result<()>;
}

/// Getter parses itself out of a message.
pub trait Getter {
    fn get_from(&mut self, m: &Message) -> Result<()>;
}

/// Checker validates an aspect of a received message.
pub trait Checker {
    fn check(&self, m: &Message) -> Result<()>;
}

/// TransactionId uniquely pairs a request with its response.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct TransactionId(pub [u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    /// Returns a fresh id drawn from the process CSPRNG.
    pub fn new() -> Self {
        let mut id = TransactionId([0u8; TRANSACTION_ID_SIZE]);
        rand::thread_rng().fill(&mut id.0);
        id
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl Setter for TransactionId {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.transaction_id = *self;
        m.write_transaction_id();
        Ok(())
    }
}

/// Quick multiplexing test: a datagram can only be STUN if it is at least
/// a header long and the two topmost bits of the first byte are zero.
/// Decoding still has to succeed; this does not inspect the magic cookie.
pub fn is_message(b: &[u8]) -> bool {
    b.len() >= MESSAGE_HEADER_SIZE && b[0] & 0xC0 == 0
}

/// Message is a single STUN packet. The raw wire encoding is kept in step
/// with the decoded fields so that MESSAGE-INTEGRITY and FINGERPRINT can
/// be computed over the exact bytes.
#[derive(Default, Debug, Clone)]
pub struct Message {
    pub typ: MessageType,
    /// Length of the attribute section (excludes the 20-byte header).
    pub length: u32,
    pub transaction_id: TransactionId,
    pub attributes: Attributes,
    pub raw: Vec<u8>,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} l={} attrs={} id={}",
            self.typ,
            self.length,
            self.attributes.0.len(),
            self.transaction_id
        )
    }
}

/// Raw bytes are ignored: two messages are equal when their decoded parts are.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.typ == other.typ
            && self.length == other.length
            && self.transaction_id == other.transaction_id
            && self.attributes == other.attributes
    }
}

const DEFAULT_RAW_CAPACITY: usize = 120;

impl Message {
    /// Returns a message with a pre-allocated zeroed header.
    pub fn new() -> Self {
        Message {
            raw: {
                let mut raw = Vec::with_capacity(DEFAULT_RAW_CAPACITY);
                raw.extend_from_slice(&[0; MESSAGE_HEADER_SIZE]);
                raw
            },
            ..Default::default()
        }
    }

    /// Assigns a random transaction id and writes it to the raw buffer.
    pub fn new_transaction_id(&mut self) {
        self.transaction_id = TransactionId::new();
        self.write_transaction_id();
    }

    pub fn reset(&mut self) {
        self.raw.clear();
        self.length = 0;
        self.attributes.0.clear();
    }

    fn grow(&mut self, n: usize) {
        if self.raw.len() < n {
            self.raw.resize(n, 0);
        }
    }

    /// Appends a type-length-value attribute, padding the value with zero
    /// bytes out to a four byte boundary, and rewrites the header length.
    pub fn add(&mut self, t: AttrType, v: &[u8]) {
        let first = MESSAGE_HEADER_SIZE + self.length as usize;
        let padded = nearest_padded_value_length(v.len());
        self.grow(first + ATTRIBUTE_HEADER_SIZE + padded);

        let buf = &mut self.raw[first..];
        buf[0..2].copy_from_slice(&t.value().to_be_bytes());
        buf[2..4].copy_from_slice(&(v.len() as u16).to_be_bytes());
        buf[ATTRIBUTE_HEADER_SIZE..ATTRIBUTE_HEADER_SIZE + v.len()].copy_from_slice(v);
        for b in &mut buf[ATTRIBUTE_HEADER_SIZE + v.len()..ATTRIBUTE_HEADER_SIZE + padded] {
            *b = 0;
        }

        self.length += (ATTRIBUTE_HEADER_SIZE + padded) as u32;
        self.attributes.0.push(RawAttribute {
            typ: t,
            length: v.len() as u16,
            value: v.to_vec(),
        });
        self.write_length();
    }

    pub fn write_length(&mut self) {
        self.grow(4);
        self.raw[2..4].copy_from_slice(&(self.length as u16).to_be_bytes());
    }

    pub fn write_type(&mut self) {
        self.grow(2);
        self.raw[..2].copy_from_slice(&self.typ.value().to_be_bytes());
    }

    pub fn set_type(&mut self, t: MessageType) {
        self.typ = t;
        self.write_type();
    }

    pub fn write_transaction_id(&mut self) {
        self.raw[8..MESSAGE_HEADER_SIZE].copy_from_slice(&self.transaction_id.0);
    }

    /// Writes type, length, magic cookie and transaction id to the raw buffer.
    pub fn write_header(&mut self) {
        self.grow(MESSAGE_HEADER_SIZE);
        self.write_type();
        self.write_length();
        self.raw[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        self.write_transaction_id();
    }

    /// Re-encodes the message into the raw buffer from its decoded parts.
    pub fn encode(&mut self) {
        let attributes: Vec<RawAttribute> = self.attributes.0.drain(..).collect();
        self.raw.clear();
        self.length = 0;
        self.raw.extend_from_slice(&[0; MESSAGE_HEADER_SIZE]);
        self.write_header();
        for a in &attributes {
            self.add(a.typ, &a.value);
        }
    }

    /// Decodes the raw buffer into type, transaction id and attributes.
    pub fn decode(&mut self) -> Result<()> {
        let buf = &self.raw;
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::ErrInsufficientData {
                expected: MESSAGE_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let t = u16::from_be_bytes([buf[0], buf[1]]);
        let size = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if cookie != MAGIC_COOKIE {
            return Err(Error::ErrInvalidMagicCookie { value: cookie });
        }
        if buf.len() < MESSAGE_HEADER_SIZE + size {
            return Err(Error::ErrInsufficientData {
                expected: MESSAGE_HEADER_SIZE + size,
                actual: buf.len(),
            });
        }

        self.typ.read_value(t);
        self.length = size as u32;
        self.transaction_id
            .0
            .copy_from_slice(&buf[8..MESSAGE_HEADER_SIZE]);

        self.attributes.0.clear();
        let mut b = &buf[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + size];
        while !b.is_empty() {
            if b.len() < ATTRIBUTE_HEADER_SIZE {
                return Err(Error::ErrInvalidFormat(format!(
                    "short attribute header: {} bytes left",
                    b.len()
                )));
            }
            let typ = AttrType(u16::from_be_bytes([b[0], b[1]]));
            let length = u16::from_be_bytes([b[2], b[3]]);
            b = &b[ATTRIBUTE_HEADER_SIZE..];

            let value_len = length as usize;
            if b.len() < value_len {
                return Err(Error::ErrInvalidFormat(format!(
                    "attribute {typ} value truncated: need {value_len}, have {}",
                    b.len()
                )));
            }
            let value = b[..value_len].to_vec();
            // A sender may omit the padding of the final attribute.
            let advance = nearest_padded_value_length(value_len).min(b.len());
            b = &b[advance..];

            self.attributes.0.push(RawAttribute { typ, length, value });
        }

        Ok(())
    }

    /// Decodes `buf` into this message, replacing any previous content.
    pub fn unmarshal_binary(&mut self, buf: &[u8]) -> Result<()> {
        self.raw.clear();
        self.raw.extend_from_slice(buf);
        self.decode()
    }

    pub fn contains(&self, t: AttrType) -> bool {
        self.attributes.get(t).is_some()
    }

    /// Returns the value of the first attribute of type `t`.
    pub fn get(&self, t: AttrType) -> Result<Vec<u8>> {
        match self.attributes.get(t) {
            Some(a) => Ok(a.value.clone()),
            None => Err(Error::ErrAttributeNotFound),
        }
    }

    /// Resets the message and applies setters in order, stopping on the
    /// first error.
    pub fn build(&mut self, setters: &[&dyn Setter]) -> Result<()> {
        self.reset();
        self.raw.extend_from_slice(&[0; MESSAGE_HEADER_SIZE]);
        self.write_header();
        for s in setters {
            s.add_to(self)?;
        }
        Ok(())
    }
}

/// MessageClass is the 2-bit class of a STUN message type.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct MessageClass(pub u8);

pub const CLASS_REQUEST: MessageClass = MessageClass(0x00);
pub const CLASS_INDICATION: MessageClass = MessageClass(0x01);
pub const CLASS_SUCCESS_RESPONSE: MessageClass = MessageClass(0x02);
pub const CLASS_ERROR_RESPONSE: MessageClass = MessageClass(0x03);

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CLASS_REQUEST => "request",
            CLASS_INDICATION => "indication",
            CLASS_SUCCESS_RESPONSE => "success response",
            CLASS_ERROR_RESPONSE => "error response",
            _ => "unknown message class",
        };
        write!(f, "{s}")
    }
}

/// Method is the 12-bit STUN method.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct Method(pub u16);

pub const METHOD_BINDING: Method = Method(0x001);

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            METHOD_BINDING => write!(f, "Binding"),
            Method(other) => write!(f, "{other:#05x}"),
        }
    }
}

/// MessageType is the 14-bit type field combining method and class.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

pub const BINDING_REQUEST: MessageType = MessageType {
    method: METHOD_BINDING,
    class: CLASS_REQUEST,
};
pub const BINDING_SUCCESS: MessageType = MessageType {
    method: METHOD_BINDING,
    class: CLASS_SUCCESS_RESPONSE,
};
pub const BINDING_ERROR: MessageType = MessageType {
    method: METHOD_BINDING,
    class: CLASS_ERROR_RESPONSE,
};

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.class)
    }
}

// Method bits are split into A (M0-M3), B (M4-M6) and D (M7-M11) around
// the class bits C0 (offset 4) and C1 (offset 8); see RFC 5389 §6 fig. 3.
const METHOD_ABITS: u16 = 0x000F;
const METHOD_BBITS: u16 = 0x0070;
const METHOD_DBITS: u16 = 0x0F80;

const METHOD_BSHIFT: u16 = 1;
const METHOD_DSHIFT: u16 = 2;

const C0BIT: u16 = 0x1;
const C1BIT: u16 = 0x2;

const CLASS_C0SHIFT: u16 = 4;
const CLASS_C1SHIFT: u16 = 7;

impl Setter for MessageType {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.set_type(*self);
        Ok(())
    }
}

impl MessageType {
    pub fn new(method: Method, class: MessageClass) -> Self {
        MessageType { method, class }
    }

    /// Interleaves method and class into the 14-bit wire value.
    pub fn value(&self) -> u16 {
        let method = self.method.0;
        let a = method & METHOD_ABITS;
        let b = method & METHOD_BBITS;
        let d = method & METHOD_DBITS;
        let method = a + (b << METHOD_BSHIFT) + (d << METHOD_DSHIFT);

        let c = self.class.0 as u16;
        let class = ((c & C0BIT) << CLASS_C0SHIFT) + ((c & C1BIT) << CLASS_C1SHIFT);

        method + class
    }

    /// Unpacks a 16-bit wire value into method and class.
    pub fn read_value(&mut self, value: u16) {
        let c0 = (value >> CLASS_C0SHIFT) & C0BIT;
        let c1 = (value >> CLASS_C1SHIFT) & C1BIT;
        self.class = MessageClass((c0 + c1) as u8);

        let a = value & METHOD_ABITS;
        let b = (value >> METHOD_BSHIFT) & METHOD_BBITS;
        let d = (value >> METHOD_DSHIFT) & METHOD_DBITS;
        self.method = Method(a + b + d);
    }
}
