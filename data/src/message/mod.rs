pub mod message_channel_ack;
pub mod message_channel_open;
pub mod message_type;

use bytes::{Bytes, BytesMut};
use message_channel_ack::*;
use message_channel_open::*;
use message_type::*;

use crate::error::Result;

/// A parsed DCEP message (RFC 8832 §5).
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Message {
    DataChannelAck(DataChannelAck),
    DataChannelOpen(DataChannelOpen),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::DataChannelAck(_) => MessageType::DataChannelAck,
            Self::DataChannelOpen(_) => MessageType::DataChannelOpen,
        }
    }

    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        match MessageType::unmarshal(raw)? {
            MessageType::DataChannelAck => Ok(Self::DataChannelAck(DataChannelAck {})),
            MessageType::DataChannelOpen => Ok(Self::DataChannelOpen(DataChannelOpen::unmarshal(
                &raw.slice(MESSAGE_TYPE_LEN..),
            )?)),
        }
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.message_type().marshal_to(&mut buf);
        if let Self::DataChannelOpen(open) = self {
            open.marshal_to(&mut buf);
        }
        buf.freeze()
    }
}
