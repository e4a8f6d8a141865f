use std::collections::HashMap;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, trace, warn};
use rand::Rng;

use crate::chunk::chunk_cookie_ack::ChunkCookieAck;
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_heartbeat_ack::ChunkHeartbeatAck;
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::chunk::chunk_shutdown::ChunkShutdown;
use crate::chunk::chunk_shutdown_ack::ChunkShutdownAck;
use crate::chunk::chunk_shutdown_complete::ChunkShutdownComplete;
use crate::chunk::Chunk;
use crate::cookie::StateCookie;
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::param::param_heartbeat_info::ParamHeartbeatInfo;
use crate::param::param_state_cookie::ParamStateCookie;
use crate::param::Param;
use crate::queue::assembler::{FragmentAssembler, DEFAULT_MAX_FRAGMENT_GROUPS};
use crate::queue::rtx::RetransmissionQueue;
use crate::queue::tracker::TsnTracker;

pub use crate::queue::assembler::ReceivedMessage;

/// Receive window advertised to the peer.
const DEFAULT_A_RWND: u32 = 131_072;

const DEFAULT_MTU: u32 = 1228;

/// Per-chunk payload budget: MTU minus packet and DATA chunk headers.
const PAYLOAD_DATA_OVERHEAD: u32 = 12 + 16;

/// Association lifecycle (RFC 4960 §4). The server side stays `Closed`
/// until a valid COOKIE-ECHO arrives; the client walks
/// CookieWait → CookieEchoed → Established.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AssociationState::Closed => "Closed",
            AssociationState::CookieWait => "CookieWait",
            AssociationState::CookieEchoed => "CookieEchoed",
            AssociationState::Established => "Established",
            AssociationState::ShutdownPending => "ShutdownPending",
            AssociationState::ShutdownSent => "ShutdownSent",
            AssociationState::ShutdownReceived => "ShutdownReceived",
            AssociationState::ShutdownAckSent => "ShutdownAckSent",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct AssociationConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub max_inbound_streams: u16,
    pub max_outbound_streams: u16,
    pub mtu: u32,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        AssociationConfig {
            local_port: 5000,
            remote_port: 5000,
            max_inbound_streams: 1024,
            max_outbound_streams: 1024,
            mtu: DEFAULT_MTU,
        }
    }
}

/// What one inbound packet produced: packets to send back and messages to
/// hand up.
#[derive(Debug, Default)]
pub struct PacketResult {
    pub responses: Vec<Bytes>,
    pub messages: Vec<ReceivedMessage>,
}

/// A sans-I/O SCTP association. Every operation is a synchronous
/// transformation: bytes in via [`process`](Association::process), bytes
/// out as return values. The caller owns time and calls
/// [`pending_retransmissions`](Association::pending_retransmissions)
/// periodically.
#[derive(Debug)]
pub struct Association {
    state: AssociationState,
    local_port: u16,
    remote_port: u16,

    local_verification_tag: u32,
    peer_verification_tag: u32,

    next_tsn: u32,
    stream_sequence_numbers: HashMap<u16, u16>,

    my_a_rwnd: u32,
    peer_a_rwnd: u32,
    num_outbound_streams: u16,
    num_inbound_streams: u16,
    mtu: u32,

    cookie_secret: [u8; 32],

    tracker: Option<TsnTracker>,
    assembler: FragmentAssembler,
    rtx: RetransmissionQueue,
    /// Set while the packet being processed carried DATA chunks.
    sack_due: bool,
}

impl Association {
    pub fn new(config: AssociationConfig) -> Self {
        let mut rng = rand::thread_rng();
        let mut cookie_secret = [0u8; 32];
        rng.fill(&mut cookie_secret);

        // Tags must be nonzero; zero marks an out-of-the-blue INIT.
        let local_verification_tag = rng.gen_range(1..=u32::MAX);
        let next_tsn = rng.gen::<u32>();

        Association {
            state: AssociationState::Closed,
            local_port: config.local_port,
            remote_port: config.remote_port,
            local_verification_tag,
            peer_verification_tag: 0,
            next_tsn,
            stream_sequence_numbers: HashMap::new(),
            my_a_rwnd: DEFAULT_A_RWND,
            peer_a_rwnd: 0,
            num_outbound_streams: config.max_outbound_streams,
            num_inbound_streams: config.max_inbound_streams,
            mtu: config.mtu,
            cookie_secret,
            tracker: None,
            assembler: FragmentAssembler::new(DEFAULT_MAX_FRAGMENT_GROUPS),
            rtx: RetransmissionQueue::new(config.mtu),
            sack_due: false,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == AssociationState::Established
    }

    /// Client entry point: emits the INIT packet. INIT always travels
    /// under verification tag zero.
    pub fn start(&mut self) -> Result<Bytes> {
        if self.state != AssociationState::Closed {
            return Err(Error::ErrAssociationFailed(format!(
                "start in state {}",
                self.state
            )));
        }

        let init = ChunkInit {
            is_ack: false,
            initiate_tag: self.local_verification_tag,
            advertised_receiver_window_credit: self.my_a_rwnd,
            num_outbound_streams: self.num_outbound_streams,
            num_inbound_streams: self.num_inbound_streams,
            initial_tsn: self.next_tsn,
            params: vec![],
        };

        self.state = AssociationState::CookieWait;
        debug!("[sctp] sending INIT, entering CookieWait");
        self.packet(0, vec![Box::new(init)]).marshal()
    }

    /// Feeds one decrypted datagram into the association.
    pub fn process(&mut self, raw: &Bytes, now: Instant) -> Result<PacketResult> {
        let packet = Packet::unmarshal(raw)?;
        packet.check_packet()?;

        let mut result = PacketResult::default();
        for chunk in &packet.chunks {
            self.process_chunk(&packet, chunk.as_ref(), now, &mut result)?;
        }

        // Every accepted DATA chunk in the packet is answered by a single
        // selective ack reflecting the tracker afterwards.
        if let Some(sack) = self.take_pending_sack() {
            result.responses.push(self.packet(self.peer_verification_tag, vec![sack]).marshal()?);
        }

        Ok(result)
    }

    fn process_chunk(
        &mut self,
        packet: &Packet,
        chunk: &(dyn Chunk + Send + Sync),
        now: Instant,
        result: &mut PacketResult,
    ) -> Result<()> {
        let any = chunk.as_any();

        if let Some(init) = any.downcast_ref::<ChunkInit>() {
            // INIT rides tag zero; everything else must carry our tag.
            if init.is_ack {
                self.expect_local_tag(packet)?;
                return self.handle_init_ack(init, result);
            }
            return self.handle_init(init, result);
        }

        if packet.verification_tag != self.local_verification_tag {
            warn!(
                "[sctp] dropping chunk with bad verification tag {} (want {})",
                packet.verification_tag, self.local_verification_tag
            );
            return Ok(());
        }

        if let Some(data) = any.downcast_ref::<ChunkPayloadData>() {
            self.handle_data(data, result);
        } else if let Some(sack) = any.downcast_ref::<ChunkSelectiveAck>() {
            self.handle_sack(sack, now, result)?;
        } else if let Some(echo) = any.downcast_ref::<ChunkCookieEcho>() {
            self.handle_cookie_echo(echo, result)?;
        } else if any.downcast_ref::<ChunkCookieAck>().is_some() {
            self.handle_cookie_ack();
        } else if let Some(hb) = any.downcast_ref::<ChunkHeartbeat>() {
            self.handle_heartbeat(hb, result)?;
        } else if any.downcast_ref::<ChunkHeartbeatAck>().is_some() {
            trace!("[sctp] heartbeat ack received");
        } else if any.downcast_ref::<ChunkShutdown>().is_some() {
            self.handle_shutdown(result)?;
        } else if any.downcast_ref::<ChunkShutdownAck>().is_some() {
            self.handle_shutdown_ack(result)?;
        } else if any.downcast_ref::<ChunkShutdownComplete>().is_some() {
            debug!("[sctp] shutdown complete, association closed");
            self.state = AssociationState::Closed;
        } else {
            // The packet as a whole validated; an unhandled chunk type is
            // dropped, not fatal (RFC 4960 §3.2 action 00).
            warn!("[sctp] dropping unhandled chunk {chunk}");
        }

        Ok(())
    }

    fn expect_local_tag(&self, packet: &Packet) -> Result<()> {
        if packet.verification_tag != self.local_verification_tag {
            return Err(Error::ErrAssociationFailed(format!(
                "verification tag {} does not match {}",
                packet.verification_tag, self.local_verification_tag
            )));
        }
        Ok(())
    }

    /// Server side of the handshake: answer INIT with INIT-ACK carrying
    /// an HMAC-bound state cookie. No association state is committed
    /// beyond what the cookie itself captures.
    fn handle_init(&mut self, init: &ChunkInit, result: &mut PacketResult) -> Result<()> {
        match self.state {
            AssociationState::Closed | AssociationState::CookieWait => {}
            _ => return Err(Error::ErrHandleInitState),
        }

        self.peer_verification_tag = init.initiate_tag;
        self.peer_a_rwnd = init.advertised_receiver_window_credit;
        self.num_outbound_streams = self.num_outbound_streams.min(init.num_inbound_streams);
        self.num_inbound_streams = self.num_inbound_streams.min(init.num_outbound_streams);
        self.tracker = Some(TsnTracker::new(init.initial_tsn));

        let cookie = StateCookie::new(
            unix_millis(),
            init.initiate_tag,
            self.local_verification_tag,
            init.initial_tsn,
            init.advertised_receiver_window_credit,
            self.num_outbound_streams,
            self.num_inbound_streams,
            &self.cookie_secret,
        );

        let init_ack = ChunkInit {
            is_ack: true,
            initiate_tag: self.local_verification_tag,
            advertised_receiver_window_credit: self.my_a_rwnd,
            num_outbound_streams: self.num_outbound_streams,
            num_inbound_streams: self.num_inbound_streams,
            initial_tsn: self.next_tsn,
            params: vec![Box::new(ParamStateCookie {
                cookie: cookie.marshal(),
            }) as Box<dyn Param + Send + Sync>],
        };

        debug!("[sctp] INIT received, answering with INIT-ACK + cookie");
        result
            .responses
            .push(self.packet(self.peer_verification_tag, vec![Box::new(init_ack)]).marshal()?);
        Ok(())
    }

    /// Client side: store the cookie verbatim and echo it.
    fn handle_init_ack(&mut self, init_ack: &ChunkInit, result: &mut PacketResult) -> Result<()> {
        if self.state != AssociationState::CookieWait {
            trace!("[sctp] ignoring INIT-ACK in state {}", self.state);
            return Ok(());
        }

        let cookie = init_ack.state_cookie().ok_or(Error::ErrInitAckNoCookie)?;
        self.peer_verification_tag = init_ack.initiate_tag;
        self.peer_a_rwnd = init_ack.advertised_receiver_window_credit;
        self.num_outbound_streams = self.num_outbound_streams.min(init_ack.num_inbound_streams);
        self.num_inbound_streams = self.num_inbound_streams.min(init_ack.num_outbound_streams);
        self.tracker = Some(TsnTracker::new(init_ack.initial_tsn));

        self.state = AssociationState::CookieEchoed;
        debug!("[sctp] INIT-ACK received, echoing cookie");
        result.responses.push(
            self.packet(
                self.peer_verification_tag,
                vec![Box::new(ChunkCookieEcho { cookie })],
            )
            .marshal()?,
        );
        Ok(())
    }

    /// Server side: validate MAC and age, restore the association
    /// parameters the cookie binds, and confirm.
    fn handle_cookie_echo(
        &mut self,
        echo: &ChunkCookieEcho,
        result: &mut PacketResult,
    ) -> Result<()> {
        match self.state {
            AssociationState::Closed | AssociationState::Established => {}
            _ => {
                trace!("[sctp] ignoring COOKIE-ECHO in state {}", self.state);
                return Ok(());
            }
        }

        let cookie = StateCookie::unmarshal(&echo.cookie)?;
        cookie.verify(&self.cookie_secret, unix_millis())?;

        self.peer_verification_tag = cookie.peer_tag;
        self.peer_a_rwnd = cookie.peer_a_rwnd;
        self.num_outbound_streams = cookie.num_outbound_streams;
        self.num_inbound_streams = cookie.num_inbound_streams;
        if self.tracker.is_none() {
            self.tracker = Some(TsnTracker::new(cookie.peer_initial_tsn));
        }

        if self.state != AssociationState::Established {
            debug!("[sctp] cookie validated, association established");
            self.state = AssociationState::Established;
        }
        result.responses.push(
            self.packet(self.peer_verification_tag, vec![Box::new(ChunkCookieAck {})])
                .marshal()?,
        );
        Ok(())
    }

    fn handle_cookie_ack(&mut self) {
        if self.state == AssociationState::CookieEchoed {
            debug!("[sctp] cookie acknowledged, association established");
            self.state = AssociationState::Established;
        }
    }

    fn handle_data(&mut self, data: &ChunkPayloadData, result: &mut PacketResult) {
        let tracker = match self.tracker.as_mut() {
            Some(t) => t,
            None => {
                warn!("[sctp] DATA before handshake, dropping");
                return;
            }
        };

        // Duplicates are answered too: the next SACK reports them.
        let accepted = tracker.receive(data.tsn);
        self.sack_due = true;
        if accepted {
            result.messages.extend(self.assembler.push(data.clone()));
        }
    }

    fn handle_sack(
        &mut self,
        sack: &ChunkSelectiveAck,
        now: Instant,
        result: &mut PacketResult,
    ) -> Result<()> {
        self.peer_a_rwnd = sack.advertised_receiver_window_credit;
        self.rtx
            .acknowledge(sack.cumulative_tsn_ack, &sack.gap_ack_blocks, now);

        // A deferred shutdown leaves once the queue drains.
        if self.state == AssociationState::ShutdownPending && self.rtx.is_empty() {
            self.state = AssociationState::ShutdownSent;
            debug!("[sctp] retransmission queue drained, sending SHUTDOWN");
            let cumulative = self
                .tracker
                .as_ref()
                .map(|t| t.cumulative_tsn())
                .unwrap_or(0);
            result.responses.push(
                self.packet(
                    self.peer_verification_tag,
                    vec![Box::new(ChunkShutdown {
                        cumulative_tsn_ack: cumulative,
                    })],
                )
                .marshal()?,
            );
        }
        Ok(())
    }

    fn handle_heartbeat(&mut self, hb: &ChunkHeartbeat, result: &mut PacketResult) -> Result<()> {
        // The info parameter is opaque and goes back exactly as it came.
        let ack = ChunkHeartbeatAck {
            params: hb.params.clone(),
        };
        result.responses.push(
            self.packet(self.peer_verification_tag, vec![Box::new(ack)])
                .marshal()?,
        );
        Ok(())
    }

    fn handle_shutdown(&mut self, result: &mut PacketResult) -> Result<()> {
        match self.state {
            AssociationState::Established
            | AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived => {}
            _ => return Ok(()),
        }

        // Nothing buffers between receipt and the ack here, so the
        // ShutdownReceived state collapses into ShutdownAckSent.
        debug!("[sctp] SHUTDOWN received, acknowledging");
        self.state = AssociationState::ShutdownAckSent;
        result.responses.push(
            self.packet(self.peer_verification_tag, vec![Box::new(ChunkShutdownAck {})])
                .marshal()?,
        );
        Ok(())
    }

    fn handle_shutdown_ack(&mut self, result: &mut PacketResult) -> Result<()> {
        match self.state {
            AssociationState::ShutdownSent | AssociationState::ShutdownAckSent => {}
            _ => return Ok(()),
        }
        debug!("[sctp] SHUTDOWN-ACK received, completing");
        self.state = AssociationState::Closed;
        result.responses.push(
            self.packet(
                self.peer_verification_tag,
                vec![Box::new(ChunkShutdownComplete {})],
            )
            .marshal()?,
        );
        Ok(())
    }

    fn take_pending_sack(&mut self) -> Option<Box<dyn Chunk + Send + Sync>> {
        // Only answer when this packet actually carried DATA.
        if !self.sack_due {
            return None;
        }
        self.sack_due = false;

        let my_a_rwnd = self.my_a_rwnd;
        let tracker = self.tracker.as_mut()?;
        let duplicates = tracker.take_duplicates();
        let gaps = tracker.gap_blocks();
        Some(Box::new(ChunkSelectiveAck {
            cumulative_tsn_ack: tracker.cumulative_tsn(),
            advertised_receiver_window_credit: my_a_rwnd,
            gap_ack_blocks: gaps,
            duplicate_tsn: duplicates,
        }))
    }

    /// Queues one user message. TSN and per-stream sequence assignment
    /// happen together here, under whatever lock the caller holds around
    /// the association. Messages larger than the MTU budget are split
    /// into B/../E fragments sharing one stream sequence number.
    pub fn send(
        &mut self,
        stream_id: u16,
        ppi: PayloadProtocolIdentifier,
        data: Bytes,
        unordered: bool,
        now: Instant,
    ) -> Result<Vec<Bytes>> {
        if self.state != AssociationState::Established {
            return Err(Error::ErrPayloadDataStateNotExist);
        }

        let ssn = if unordered {
            0
        } else {
            let next = self.stream_sequence_numbers.entry(stream_id).or_insert(0);
            let ssn = *next;
            *next = next.wrapping_add(1);
            ssn
        };

        let max_payload = (self.mtu - PAYLOAD_DATA_OVERHEAD) as usize;
        let fragments: Vec<Bytes> = if data.len() <= max_payload {
            vec![data]
        } else {
            let mut pieces = vec![];
            let mut rest = data;
            while rest.len() > max_payload {
                pieces.push(rest.split_to(max_payload));
            }
            pieces.push(rest);
            pieces
        };

        let count = fragments.len();
        let mut packets = Vec::with_capacity(count);
        for (idx, user_data) in fragments.into_iter().enumerate() {
            let chunk = ChunkPayloadData {
                unordered,
                beginning_fragment: idx == 0,
                ending_fragment: idx == count - 1,
                tsn: self.next_tsn,
                stream_identifier: stream_id,
                stream_sequence_number: ssn,
                payload_type: ppi,
                user_data,
            };
            self.next_tsn = self.next_tsn.wrapping_add(1);
            self.rtx.enqueue(chunk.clone(), now);
            packets.push(
                self.packet(self.peer_verification_tag, vec![Box::new(chunk)])
                    .marshal()?,
            );
        }
        Ok(packets)
    }

    /// Re-encodes chunks that are due (RTO expired or fast-retransmit
    /// marked). A chunk over its retransmission budget is fatal.
    pub fn pending_retransmissions(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        let chunks = self.rtx.pending_retransmissions(now)?;
        chunks
            .into_iter()
            .map(|c| {
                self.packet(self.peer_verification_tag, vec![Box::new(c)])
                    .marshal()
            })
            .collect()
    }

    /// Outbound HEARTBEAT probe carrying an opaque timestamped info blob.
    pub fn heartbeat(&mut self) -> Result<Bytes> {
        if self.state != AssociationState::Established {
            return Err(Error::ErrPayloadDataStateNotExist);
        }
        let info = ParamHeartbeatInfo {
            heartbeat_information: Bytes::copy_from_slice(&unix_millis().to_be_bytes()),
        };
        self.packet(
            self.peer_verification_tag,
            vec![Box::new(ChunkHeartbeat {
                params: vec![Box::new(info) as Box<dyn Param + Send + Sync>],
            })],
        )
        .marshal()
    }

    /// Begins the close. Established associations with a drained queue
    /// emit SHUTDOWN right away; with data still in flight the shutdown
    /// is deferred until the final SACK. Any other state drops straight
    /// to Closed. The cookie secret is wiped either way.
    pub fn close(&mut self) -> Result<Option<Bytes>> {
        self.cookie_secret.fill(0);

        match self.state {
            AssociationState::Established => {
                if self.rtx.is_empty() {
                    self.state = AssociationState::ShutdownSent;
                    let cumulative = self
                        .tracker
                        .as_ref()
                        .map(|t| t.cumulative_tsn())
                        .unwrap_or(0);
                    debug!("[sctp] closing, sending SHUTDOWN");
                    let raw = self
                        .packet(
                            self.peer_verification_tag,
                            vec![Box::new(ChunkShutdown {
                                cumulative_tsn_ack: cumulative,
                            })],
                        )
                        .marshal()?;
                    Ok(Some(raw))
                } else {
                    debug!("[sctp] closing with data in flight, shutdown pending");
                    self.state = AssociationState::ShutdownPending;
                    Ok(None)
                }
            }
            _ => {
                self.state = AssociationState::Closed;
                Ok(None)
            }
        }
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.rtx.bytes_in_flight()
    }

    /// The peer's advertised receiver window, as last reported.
    pub fn peer_rwnd(&self) -> u32 {
        self.peer_a_rwnd
    }

    fn packet(&self, verification_tag: u32, chunks: Vec<Box<dyn Chunk + Send + Sync>>) -> Packet {
        Packet {
            source_port: self.local_port,
            destination_port: self.remote_port,
            verification_tag,
            chunks,
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (Association, Association) {
        let client = Association::new(AssociationConfig::default());
        let server = Association::new(AssociationConfig::default());
        (client, server)
    }

    /// Delivers packets back and forth until both sides go quiet,
    /// returning every message each side delivered up.
    fn pump(
        a: &mut Association,
        b: &mut Association,
        initial: Vec<Bytes>,
        now: Instant,
    ) -> (Vec<ReceivedMessage>, Vec<ReceivedMessage>) {
        let mut to_b = initial;
        let mut to_a: Vec<Bytes> = vec![];
        let mut a_msgs = vec![];
        let mut b_msgs = vec![];

        while !to_a.is_empty() || !to_b.is_empty() {
            let mut next_to_a = vec![];
            for raw in to_b.drain(..) {
                let out = b.process(&raw, now).unwrap();
                next_to_a.extend(out.responses);
                b_msgs.extend(out.messages);
            }
            for raw in to_a.drain(..) {
                let out = a.process(&raw, now).unwrap();
                to_b.extend(out.responses);
                a_msgs.extend(out.messages);
            }
            to_a = next_to_a;
        }
        (a_msgs, b_msgs)
    }

    fn established_pair() -> (Association, Association) {
        let (mut client, mut server) = pair();
        let init = client.start().unwrap();
        pump(&mut client, &mut server, vec![init], Instant::now());
        assert!(client.is_established());
        assert!(server.is_established());
        (client, server)
    }

    #[test]
    fn test_four_way_handshake() {
        let now = Instant::now();
        let (mut client, mut server) = pair();

        // INIT travels under verification tag zero.
        let init_raw = client.start().unwrap();
        assert_eq!(client.state(), AssociationState::CookieWait);
        let init_pkt = Packet::unmarshal(&init_raw).unwrap();
        assert_eq!(init_pkt.verification_tag, 0);

        // INIT -> INIT-ACK (with cookie), server commits nothing yet.
        let out = server.process(&init_raw, now).unwrap();
        assert_eq!(out.responses.len(), 1);
        assert_eq!(server.state(), AssociationState::Closed);

        // INIT-ACK -> COOKIE-ECHO.
        let out2 = client.process(&out.responses[0], now).unwrap();
        assert_eq!(out2.responses.len(), 1);
        assert_eq!(client.state(), AssociationState::CookieEchoed);

        // COOKIE-ECHO -> COOKIE-ACK, server established.
        let out3 = server.process(&out2.responses[0], now).unwrap();
        assert_eq!(out3.responses.len(), 1);
        assert_eq!(server.state(), AssociationState::Established);

        // COOKIE-ACK, client established.
        let out4 = client.process(&out3.responses[0], now).unwrap();
        assert!(out4.responses.is_empty());
        assert_eq!(client.state(), AssociationState::Established);
    }

    #[test]
    fn test_cookie_echo_with_wrong_mac_rejected() {
        let now = Instant::now();
        let (mut client, mut server) = pair();
        let init_raw = client.start().unwrap();
        let init_ack = server.process(&init_raw, now).unwrap().responses.remove(0);
        let cookie_echo = client.process(&init_ack, now).unwrap().responses.remove(0);

        // A different association shares no cookie secret; the echoed
        // cookie must not validate there.
        let mut other = Association::new(AssociationConfig::default());
        // Retag the packet so it passes the other side's tag check.
        let pkt = Packet::unmarshal(&Bytes::from(cookie_echo.to_vec())).unwrap();
        let retagged = Packet {
            source_port: pkt.source_port,
            destination_port: pkt.destination_port,
            verification_tag: other.local_verification_tag,
            chunks: pkt.chunks,
        };
        let err = other
            .process(&retagged.marshal().unwrap(), now)
            .unwrap_err();
        assert_eq!(err, Error::ErrCookieValidationFailed);
        assert_eq!(other.state(), AssociationState::Closed);
    }

    #[test]
    fn test_single_chunk_delivery_and_sack() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        let packets = client
            .send(
                0,
                PayloadProtocolIdentifier::String,
                Bytes::from_static(b"hello"),
                false,
                now,
            )
            .unwrap();
        assert_eq!(packets.len(), 1);

        let out = server.process(&packets[0], now).unwrap();
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].stream_id, 0);
        assert_eq!(out.messages[0].ppi, PayloadProtocolIdentifier::String);
        assert_eq!(&out.messages[0].data[..], b"hello");

        // The SACK covers the single TSN with no gaps.
        assert_eq!(out.responses.len(), 1);
        let sack_pkt = Packet::unmarshal(&out.responses[0]).unwrap();
        let sack = sack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkSelectiveAck>()
            .unwrap();
        assert!(sack.gap_ack_blocks.is_empty());
        assert!(sack.duplicate_tsn.is_empty());

        // Feeding the SACK back drains the client's queue.
        assert_eq!(client.bytes_in_flight(), 5);
        client.process(&out.responses[0], now).unwrap();
        assert_eq!(client.bytes_in_flight(), 0);
    }

    #[test]
    fn test_gapped_delivery_buffers_by_sequence() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        // Three ordered messages on stream 0, seqs 0, 1, 2.
        let p0 = client
            .send(0, PayloadProtocolIdentifier::String, Bytes::from_static(b"s0"), false, now)
            .unwrap()
            .remove(0);
        let p1 = client
            .send(0, PayloadProtocolIdentifier::String, Bytes::from_static(b"s1"), false, now)
            .unwrap()
            .remove(0);
        let p2 = client
            .send(0, PayloadProtocolIdentifier::String, Bytes::from_static(b"s2"), false, now)
            .unwrap()
            .remove(0);

        // Arrival order: seq 0, seq 2, seq 1.
        let out0 = server.process(&p0, now).unwrap();
        assert_eq!(out0.messages.len(), 1);
        assert_eq!(&out0.messages[0].data[..], b"s0");

        let out2 = server.process(&p2, now).unwrap();
        assert!(out2.messages.is_empty(), "seq 2 buffered until seq 1");
        // The SACK for the out-of-order packet reports a gap.
        let sack_pkt = Packet::unmarshal(&out2.responses[0]).unwrap();
        let sack = sack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkSelectiveAck>()
            .unwrap();
        assert_eq!(sack.gap_ack_blocks.len(), 1);

        let out1 = server.process(&p1, now).unwrap();
        assert_eq!(out1.messages.len(), 2);
        assert_eq!(&out1.messages[0].data[..], b"s1");
        assert_eq!(&out1.messages[1].data[..], b"s2");

        // Final SACK has no gaps left.
        let sack_pkt = Packet::unmarshal(&out1.responses[0]).unwrap();
        let sack = sack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkSelectiveAck>()
            .unwrap();
        assert!(sack.gap_ack_blocks.is_empty());
    }

    #[test]
    fn test_fragmented_send_reassembles() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        // Larger than one MTU budget: must fragment and reassemble.
        let big: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let packets = client
            .send(
                2,
                PayloadProtocolIdentifier::Binary,
                Bytes::from(big.clone()),
                false,
                now,
            )
            .unwrap();
        assert!(packets.len() > 1);

        // Deliver out of order: last packet first.
        let mut messages = vec![];
        let mut order: Vec<usize> = (0..packets.len()).collect();
        order.rotate_left(packets.len() - 1);
        for idx in order {
            let out = server.process(&packets[idx], now).unwrap();
            messages.extend(out.messages);
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].stream_id, 2);
        assert_eq!(&messages[0].data[..], &big[..]);
    }

    #[test]
    fn test_unordered_send_skips_sequencing() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        // Ordered message held back, unordered one still delivered.
        let _skipped = client
            .send(0, PayloadProtocolIdentifier::Binary, Bytes::from_static(b"o0"), false, now)
            .unwrap();
        let p_unordered = client
            .send(0, PayloadProtocolIdentifier::Binary, Bytes::from_static(b"u"), true, now)
            .unwrap()
            .remove(0);

        let out = server.process(&p_unordered, now).unwrap();
        assert_eq!(out.messages.len(), 1);
        assert_eq!(&out.messages[0].data[..], b"u");
    }

    #[test]
    fn test_heartbeat_echoed_verbatim() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        let hb = client.heartbeat().unwrap();
        let hb_pkt = Packet::unmarshal(&hb).unwrap();
        let sent_info = hb_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkHeartbeat>()
            .unwrap()
            .heartbeat_info()
            .unwrap();

        let out = server.process(&hb, now).unwrap();
        assert_eq!(out.responses.len(), 1);
        let ack_pkt = Packet::unmarshal(&out.responses[0]).unwrap();
        let ack = ack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkHeartbeatAck>()
            .unwrap();
        let echoed = ack.params[0]
            .as_any()
            .downcast_ref::<ParamHeartbeatInfo>()
            .unwrap();
        assert_eq!(echoed.heartbeat_information, sent_info);

        client.process(&out.responses[0], now).unwrap();
    }

    #[test]
    fn test_bad_verification_tag_dropped() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        let mut packets = client
            .send(0, PayloadProtocolIdentifier::Binary, Bytes::from_static(b"x"), false, now)
            .unwrap();
        let pkt = Packet::unmarshal(&packets.remove(0)).unwrap();
        let retagged = Packet {
            source_port: pkt.source_port,
            destination_port: pkt.destination_port,
            verification_tag: pkt.verification_tag.wrapping_add(1),
            chunks: pkt.chunks,
        };

        let out = server.process(&retagged.marshal().unwrap(), now).unwrap();
        assert!(out.messages.is_empty());
        assert!(out.responses.is_empty());
    }

    #[test]
    fn test_send_requires_established() {
        let now = Instant::now();
        let (mut client, _) = pair();
        assert_eq!(
            client.send(
                0,
                PayloadProtocolIdentifier::Binary,
                Bytes::from_static(b"x"),
                false,
                now
            ),
            Err(Error::ErrPayloadDataStateNotExist)
        );
    }

    #[test]
    fn test_retransmission_and_give_up() {
        let now = Instant::now();
        let (mut client, _server) = established_pair();

        client
            .send(0, PayloadProtocolIdentifier::Binary, Bytes::from_static(b"x"), false, now)
            .unwrap();

        // Unacknowledged data comes back out after the RTO, and the
        // association gives up once the retransmit budget is spent.
        let mut t = now;
        let mut last = Ok(vec![]);
        for _ in 0..=crate::queue::rtx::DEFAULT_MAX_RETRANSMITS {
            t += crate::queue::rtx::RTO_MAX;
            last = client.pending_retransmissions(t);
            if last.is_err() {
                break;
            }
            assert_eq!(last.as_ref().unwrap().len(), 1);
        }
        assert!(matches!(last, Err(Error::ErrMaxRetransmitsExceeded { .. })));
    }

    #[test]
    fn test_graceful_shutdown_exchange() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        // Client closes with nothing in flight: SHUTDOWN goes out.
        let shutdown = client.close().unwrap().expect("immediate SHUTDOWN");
        assert_eq!(client.state(), AssociationState::ShutdownSent);

        // Server answers SHUTDOWN-ACK.
        let out = server.process(&shutdown, now).unwrap();
        assert_eq!(server.state(), AssociationState::ShutdownAckSent);
        assert_eq!(out.responses.len(), 1);

        // Client answers SHUTDOWN-COMPLETE and closes.
        let out2 = client.process(&out.responses[0], now).unwrap();
        assert_eq!(client.state(), AssociationState::Closed);
        assert_eq!(out2.responses.len(), 1);

        // Server closes on SHUTDOWN-COMPLETE.
        server.process(&out2.responses[0], now).unwrap();
        assert_eq!(server.state(), AssociationState::Closed);
    }

    #[test]
    fn test_close_with_data_in_flight_defers_shutdown() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        let data = client
            .send(0, PayloadProtocolIdentifier::Binary, Bytes::from_static(b"x"), false, now)
            .unwrap()
            .remove(0);

        assert!(client.close().unwrap().is_none());
        assert_eq!(client.state(), AssociationState::ShutdownPending);

        // The SACK for the outstanding chunk releases the SHUTDOWN.
        let sack = server.process(&data, now).unwrap().responses.remove(0);
        let out = client.process(&sack, now).unwrap();
        assert_eq!(client.state(), AssociationState::ShutdownSent);
        assert_eq!(out.responses.len(), 1);
        let pkt = Packet::unmarshal(&out.responses[0]).unwrap();
        assert!(pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkShutdown>()
            .is_some());
    }

    /// Drives a server association with hand-built packets, playing a
    /// peer whose initiate tag and initial TSN are fixed.
    #[test]
    fn test_handcrafted_peer_delivery() {
        let now = Instant::now();
        let mut server = Association::new(AssociationConfig::default());
        let peer_tag = 0x0102_0304u32;

        let send_to_server = |server: &mut Association, chunks: Vec<Box<dyn Chunk + Send + Sync>>, vtag: u32| {
            let pkt = Packet {
                source_port: 5000,
                destination_port: 5000,
                verification_tag: vtag,
                chunks,
            };
            server.process(&pkt.marshal().unwrap(), now).unwrap()
        };

        // INIT with initial TSN 1000.
        let out = send_to_server(
            &mut server,
            vec![Box::new(ChunkInit {
                is_ack: false,
                initiate_tag: peer_tag,
                advertised_receiver_window_credit: 131_072,
                num_outbound_streams: 16,
                num_inbound_streams: 16,
                initial_tsn: 1000,
                params: vec![],
            })],
            0,
        );
        let init_ack_pkt = Packet::unmarshal(&out.responses[0]).unwrap();
        assert_eq!(init_ack_pkt.verification_tag, peer_tag);
        let cookie = init_ack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkInit>()
            .unwrap()
            .state_cookie()
            .unwrap();

        // COOKIE-ECHO carries the server's own cookie back.
        let server_tag = server.local_verification_tag;
        let out = send_to_server(
            &mut server,
            vec![Box::new(ChunkCookieEcho { cookie })],
            server_tag,
        );
        assert_eq!(server.state(), AssociationState::Established);
        let ack_pkt = Packet::unmarshal(&out.responses[0]).unwrap();
        assert!(ack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkCookieAck>()
            .is_some());

        let data = |tsn: u32, seq: u16, payload: &'static [u8]| -> Box<dyn Chunk + Send + Sync> {
            Box::new(ChunkPayloadData {
                beginning_fragment: true,
                ending_fragment: true,
                tsn,
                stream_identifier: 0,
                stream_sequence_number: seq,
                payload_type: PayloadProtocolIdentifier::String,
                user_data: Bytes::from_static(payload),
                ..Default::default()
            })
        };

        // TSN 1000, seq 0: delivered, SACK cumulative 1000 with no gaps.
        let out = send_to_server(&mut server, vec![data(1000, 0, b"hello")], server_tag);
        assert_eq!(out.messages.len(), 1);
        assert_eq!(&out.messages[0].data[..], b"hello");
        let sack_pkt = Packet::unmarshal(&out.responses[0]).unwrap();
        let sack = sack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkSelectiveAck>()
            .unwrap();
        assert_eq!(sack.cumulative_tsn_ack, 1000);
        assert!(sack.gap_ack_blocks.is_empty());

        // TSN 1002 (seq 2) before 1001 (seq 1): buffer, then flush both.
        let out = send_to_server(&mut server, vec![data(1002, 2, b"s2")], server_tag);
        assert!(out.messages.is_empty());

        let out = send_to_server(&mut server, vec![data(1001, 1, b"s1")], server_tag);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(&out.messages[0].data[..], b"s1");
        assert_eq!(&out.messages[1].data[..], b"s2");
        let sack_pkt = Packet::unmarshal(&out.responses[0]).unwrap();
        let sack = sack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkSelectiveAck>()
            .unwrap();
        assert_eq!(sack.cumulative_tsn_ack, 1002);
        assert!(sack.gap_ack_blocks.is_empty());
    }

    #[test]
    fn test_duplicate_data_reported_in_sack() {
        let now = Instant::now();
        let (mut client, mut server) = established_pair();

        let p = client
            .send(0, PayloadProtocolIdentifier::Binary, Bytes::from_static(b"x"), false, now)
            .unwrap()
            .remove(0);

        let first = server.process(&p, now).unwrap();
        assert_eq!(first.messages.len(), 1);

        // Replay: no second delivery, duplicate reported.
        let second = server.process(&p, now).unwrap();
        assert!(second.messages.is_empty());
        let sack_pkt = Packet::unmarshal(&second.responses[0]).unwrap();
        let sack = sack_pkt.chunks[0]
            .as_any()
            .downcast_ref::<ChunkSelectiveAck>()
            .unwrap();
        assert_eq!(sack.duplicate_tsn.len(), 1);
    }
}
