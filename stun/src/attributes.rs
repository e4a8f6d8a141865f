
use std::fmt;

use crate::error::*;
use crate::message::{Message, Setter};

/// Attribute values are padded out to a four byte boundary on the wire.
pub const PADDING: usize = 4;

pub fn nearest_padded_value_length(len: usize) -> usize {
    let rem = len % PADDING;
    if rem == 0 {
        len
    } else {
        len + PADDING - rem
    }
}

/// AttrType is a 16-bit STUN attribute type.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub struct AttrType(pub u16);

impl AttrType {
    /// Attributes below 0x8000 are comprehension-required.
    pub fn required(&self) -> bool {
        self.0 <= 0x7FFF
    }

    /// Attributes from 0x8000 up are comprehension-optional.
    pub fn optional(&self) -> bool {
        self.0 >= 0x8000
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let other = format!("{:#06x}", self.0);

        let s = match *self {
            ATTR_USERNAME => "USERNAME",
            ATTR_MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            ATTR_ERROR_CODE => "ERROR-CODE",
            ATTR_XORMAPPED_ADDRESS => "XOR-MAPPED-ADDRESS",
            ATTR_PRIORITY => "PRIORITY",
            ATTR_USE_CANDIDATE => "USE-CANDIDATE",
            ATTR_FINGERPRINT => "FINGERPRINT",
            ATTR_ICE_CONTROLLED => "ICE-CONTROLLED",
            ATTR_ICE_CONTROLLING => "ICE-CONTROLLING",
            _ => other.as_str(),
        };

        write!(f, "{s}")
    }
}

/// Attributes from the comprehension-required range (RFC 5389).
pub const ATTR_USERNAME: AttrType = AttrType(0x0006); // USERNAME
pub const ATTR_MESSAGE_INTEGRITY: AttrType = AttrType(0x0008); // MESSAGE-INTEGRITY
pub const ATTR_ERROR_CODE: AttrType = AttrType(0x0009); // ERROR-CODE
pub const ATTR_XORMAPPED_ADDRESS: AttrType = AttrType(0x0020); // XOR-MAPPED-ADDRESS

/// Attributes from the comprehension-optional range (RFC 5389).
pub const ATTR_FINGERPRINT: AttrType = AttrType(0x8028); // FINGERPRINT

/// Attributes from RFC 8445 ICE.
pub const ATTR_PRIORITY: AttrType = AttrType(0x0024); // PRIORITY
pub const ATTR_USE_CANDIDATE: AttrType = AttrType(0x0025); // USE-CANDIDATE
pub const ATTR_ICE_CONTROLLED: AttrType = AttrType(0x8029); // ICE-CONTROLLED
pub const ATTR_ICE_CONTROLLING: AttrType = AttrType(0x802A); // ICE-CONTROLLING

/// RawAttribute is a type-length-value attribute as it sits in a message.
#[derive(Default, PartialEq, Eq, Debug, Clone)]
pub struct RawAttribute {
    pub typ: AttrType,
    /// Length of the value in bytes, before padding.
    pub length: u16,
    pub value: Vec<u8>,
}

impl fmt::Display for RawAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:02x?}", self.typ, self.value)
    }
}

impl Setter for RawAttribute {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.add(self.typ, &self.value);
        Ok(())
    }
}

/// Attributes is the ordered list of attributes decoded from a message.
#[derive(Default, PartialEq, Eq, Debug, Clone)]
pub struct Attributes(pub Vec<RawAttribute>);

impl Attributes {
    /// Returns the first attribute of type `t`, if present.
    pub fn get(&self, t: AttrType) -> Option<&RawAttribute> {
        self.0.iter().find(|a| a.typ == t)
    }
}
