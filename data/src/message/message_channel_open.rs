use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_RELIABLE_UNORDERED: u8 = 0x80;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED: u8 = 0x81;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
const CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED: u8 = 0x82;

pub const CHANNEL_PRIORITY_NORMAL: u16 = 256;

/// Channel type byte of DATA_CHANNEL_OPEN (RFC 8832 §5.1). The high bit
/// selects unordered delivery.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub enum ChannelType {
    #[default]
    Reliable,
    ReliableUnordered,
    PartialReliableRexmit,
    PartialReliableRexmitUnordered,
    PartialReliableTimed,
    PartialReliableTimedUnordered,
}

impl ChannelType {
    pub fn byte(&self) -> u8 {
        match self {
            Self::Reliable => CHANNEL_TYPE_RELIABLE,
            Self::ReliableUnordered => CHANNEL_TYPE_RELIABLE_UNORDERED,
            Self::PartialReliableRexmit => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT,
            Self::PartialReliableRexmitUnordered => CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED,
            Self::PartialReliableTimed => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED,
            Self::PartialReliableTimedUnordered => CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            CHANNEL_TYPE_RELIABLE => Ok(Self::Reliable),
            CHANNEL_TYPE_RELIABLE_UNORDERED => Ok(Self::ReliableUnordered),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT => Ok(Self::PartialReliableRexmit),
            CHANNEL_TYPE_PARTIAL_RELIABLE_REXMIT_UNORDERED => {
                Ok(Self::PartialReliableRexmitUnordered)
            }
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED => Ok(Self::PartialReliableTimed),
            CHANNEL_TYPE_PARTIAL_RELIABLE_TIMED_UNORDERED => Ok(Self::PartialReliableTimedUnordered),
            other => Err(Error::InvalidChannelType(other)),
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.byte() & 0x80 == 0
    }
}

const CHANNEL_OPEN_HEADER_LEN: usize = 11;

/// The body of a DATA_CHANNEL_OPEN message, after the type byte
/// (RFC 8832 §5.1): channel type, priority, reliability parameter, then
/// length-prefixed label and protocol.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct DataChannelOpen {
    pub channel_type: ChannelType,
    pub priority: u16,
    pub reliability_parameter: u32,
    pub label: Vec<u8>,
    pub protocol: Vec<u8>,
}

impl DataChannelOpen {
    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < CHANNEL_OPEN_HEADER_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CHANNEL_OPEN_HEADER_LEN,
                actual: raw.len(),
            });
        }

        let reader = &mut raw.clone();
        let channel_type = ChannelType::from_byte(reader.get_u8())?;
        let priority = reader.get_u16();
        let reliability_parameter = reader.get_u32();
        let label_len = reader.get_u16() as usize;
        let protocol_len = reader.get_u16() as usize;

        if reader.remaining() < label_len + protocol_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: label_len + protocol_len,
                actual: reader.remaining(),
            });
        }

        let mut label = vec![0u8; label_len];
        reader.copy_to_slice(&mut label);
        let mut protocol = vec![0u8; protocol_len];
        reader.copy_to_slice(&mut protocol);

        Ok(DataChannelOpen {
            channel_type,
            priority,
            reliability_parameter,
            label,
            protocol,
        })
    }

    pub fn marshal_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.channel_type.byte());
        buf.put_u16(self.priority);
        buf.put_u32(self.reliability_parameter);
        buf.put_u16(self.label.len() as u16);
        buf.put_u16(self.protocol.len() as u16);
        buf.extend_from_slice(&self.label);
        buf.extend_from_slice(&self.protocol);
    }
}
