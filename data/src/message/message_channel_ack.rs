/// DATA_CHANNEL_ACK carries nothing beyond its type byte (RFC 8832 §5.2).
#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
pub struct DataChannelAck;
