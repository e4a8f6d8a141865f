use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub(crate) const MESSAGE_TYPE_ACK: u8 = 0x02;
pub(crate) const MESSAGE_TYPE_OPEN: u8 = 0x03;
pub(crate) const MESSAGE_TYPE_LEN: usize = 1;

/// The one-byte DCEP message type (RFC 8832 §8.2.1).
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum MessageType {
    DataChannelAck,
    DataChannelOpen,
}

impl MessageType {
    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: MESSAGE_TYPE_LEN,
                actual: 0,
            });
        }
        match raw[0] {
            MESSAGE_TYPE_ACK => Ok(Self::DataChannelAck),
            MESSAGE_TYPE_OPEN => Ok(Self::DataChannelOpen),
            other => Err(Error::InvalidMessageType(other)),
        }
    }

    pub fn marshal_to(&self, buf: &mut BytesMut) {
        let byte = match self {
            Self::DataChannelAck => MESSAGE_TYPE_ACK,
            Self::DataChannelOpen => MESSAGE_TYPE_OPEN,
        };
        buf.put_u8(byte);
    }
}
