use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::message::message_channel_ack::DataChannelAck;
use crate::message::message_channel_open::{ChannelType, DataChannelOpen, CHANNEL_PRIORITY_NORMAL};
use crate::message::Message;

/// Data-channel lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl From<u8> for ChannelState {
    fn from(v: u8) -> Self {
        match v {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ChannelState::Connecting => "Connecting",
            ChannelState::Open => "Open",
            ChannelState::Closing => "Closing",
            ChannelState::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}

/// Which side of the association opens channels; decides stream id parity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelRole {
    /// Opens even stream ids, starting at 0.
    Initiator,
    /// Opens odd stream ids, starting at 1.
    Responder,
}

/// A single data channel riding one SCTP stream. The handle is shared
/// between the manager and the application; only the state mutates, so it
/// lives in an atomic rather than behind a lock.
#[derive(Debug)]
pub struct DataChannel {
    stream_id: u16,
    label: String,
    protocol: String,
    ordered: bool,
    state: AtomicU8,
}

impl DataChannel {
    fn new(stream_id: u16, label: String, protocol: String, ordered: bool, state: ChannelState) -> Self {
        DataChannel {
            stream_id,
            label,
            protocol,
            ordered,
            state: AtomicU8::new(state as u8),
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn state(&self) -> ChannelState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// What processing one inbound DCEP payload produced.
#[derive(Debug, Default)]
pub struct DcepResult {
    /// A DCEP payload to send back on the same stream (the ACK).
    pub reply: Option<Bytes>,
    /// A channel newly opened by the remote peer.
    pub opened: Option<Arc<DataChannel>>,
    /// A local channel the remote peer just acknowledged.
    pub acknowledged: Option<Arc<DataChannel>>,
}

/// ChannelManager owns every channel of one connection: allocation of
/// stream ids by role parity and the DATA_CHANNEL_OPEN / ACK exchange.
/// It is plain data; the connection serializes access.
#[derive(Debug)]
pub struct ChannelManager {
    role: ChannelRole,
    next_stream_id: u32,
    channels: HashMap<u16, Arc<DataChannel>>,
}

impl ChannelManager {
    pub fn new(role: ChannelRole) -> Self {
        ChannelManager {
            role,
            next_stream_id: match role {
                ChannelRole::Initiator => 0,
                ChannelRole::Responder => 1,
            },
            channels: HashMap::new(),
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn channel(&self, stream_id: u16) -> Option<Arc<DataChannel>> {
        self.channels.get(&stream_id).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<DataChannel>> {
        self.channels.values().cloned().collect()
    }

    /// Creates a channel in `Connecting` and returns it with the OPEN
    /// payload to transmit on its stream. Ids advance by two so the
    /// parity never collides with the peer's.
    pub fn open_channel(
        &mut self,
        label: &str,
        protocol: &str,
        ordered: bool,
    ) -> Result<(Arc<DataChannel>, Bytes)> {
        if self.next_stream_id > u16::MAX as u32 {
            return Err(Error::ErrNoFreeStreamId);
        }
        let stream_id = self.next_stream_id as u16;
        self.next_stream_id += 2;

        let channel = Arc::new(DataChannel::new(
            stream_id,
            label.to_owned(),
            protocol.to_owned(),
            ordered,
            ChannelState::Connecting,
        ));
        self.channels.insert(stream_id, channel.clone());

        let open = Message::DataChannelOpen(DataChannelOpen {
            channel_type: if ordered {
                ChannelType::Reliable
            } else {
                ChannelType::ReliableUnordered
            },
            priority: CHANNEL_PRIORITY_NORMAL,
            reliability_parameter: 0,
            label: label.as_bytes().to_vec(),
            protocol: protocol.as_bytes().to_vec(),
        });

        debug!("[dcep] opening channel {stream_id} label={label:?}");
        Ok((channel, open.marshal()))
    }

    /// Routes one inbound DCEP payload (PPID 50) for `stream_id`.
    pub fn handle_inbound(&mut self, stream_id: u16, payload: &Bytes) -> Result<DcepResult> {
        match Message::unmarshal(payload)? {
            Message::DataChannelOpen(open) => self.handle_open(stream_id, open),
            Message::DataChannelAck(_) => self.handle_ack(stream_id),
        }
    }

    /// A remote OPEN creates the channel already in `Open` and answers
    /// with ACK on the same stream (RFC 8832 §6).
    fn handle_open(&mut self, stream_id: u16, open: DataChannelOpen) -> Result<DcepResult> {
        if let Some(existing) = self.channels.get(&stream_id) {
            warn!(
                "[dcep] duplicate OPEN for stream {stream_id} (state {})",
                existing.state()
            );
            return Err(Error::ErrStreamExists);
        }

        let channel = Arc::new(DataChannel::new(
            stream_id,
            String::from_utf8_lossy(&open.label).into_owned(),
            String::from_utf8_lossy(&open.protocol).into_owned(),
            open.channel_type.is_ordered(),
            ChannelState::Open,
        ));
        self.channels.insert(stream_id, channel.clone());
        debug!("[dcep] remote opened channel {stream_id} label={:?}", channel.label());

        Ok(DcepResult {
            reply: Some(Message::DataChannelAck(DataChannelAck {}).marshal()),
            opened: Some(channel),
            acknowledged: None,
        })
    }

    fn handle_ack(&mut self, stream_id: u16) -> Result<DcepResult> {
        let channel = self
            .channels
            .get(&stream_id)
            .cloned()
            .ok_or(Error::ErrChannelClosed)?;
        if channel.state() == ChannelState::Connecting {
            debug!("[dcep] channel {stream_id} acknowledged");
            channel.set_state(ChannelState::Open);
        }
        Ok(DcepResult {
            reply: None,
            opened: None,
            acknowledged: Some(channel),
        })
    }

    pub fn close_channel(&mut self, stream_id: u16) {
        if let Some(channel) = self.channels.remove(&stream_id) {
            channel.set_state(ChannelState::Closed);
        }
    }

    /// Closes every channel; the handles stay valid but report `Closed`.
    pub fn close(&mut self) {
        for channel in self.channels.values() {
            channel.set_state(ChannelState::Closed);
        }
        self.channels.clear();
    }
}
