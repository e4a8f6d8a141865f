use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::mpsc;

use rivulet_data::channel::{ChannelManager, ChannelRole};
use rivulet_data::DataChannel;
use rivulet_ice::{Credentials, IceLiteAgent};
use rivulet_sctp::{Association, AssociationConfig, PayloadProtocolIdentifier};

use crate::dtls::DtlsConn;
use crate::error::{Error, Result};
use crate::mutex::Mutex;
use crate::mux::{classify, Demux};

/// Callback carrying one datagram to the peer. Supplied by the caller;
/// the stack never touches sockets.
pub type SendFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback receiving `(stream id, payload)` for application messages.
pub type DataHandler = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Unified connection state spanning ICE, DTLS and SCTP. Sub-protocol
/// failures fold upward into `Failed` exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    DtlsHandshaking,
    SctpConnecting,
    Connected,
    Disconnected,
    Failed(String),
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed(_) | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "New"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::DtlsHandshaking => write!(f, "DtlsHandshaking"),
            ConnectionState::SctpConnecting => write!(f, "SctpConnecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed(reason) => write!(f, "Failed({reason})"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Work collected under the state lock and performed after it is
/// released: datagrams to send, messages for the data handler, channels
/// for the incoming sequence.
#[derive(Default)]
struct Effects {
    outgoing: Vec<Vec<u8>>,
    deliveries: Vec<(u16, Bytes)>,
    opened: Vec<Arc<DataChannel>>,
    handler: Option<DataHandler>,
    incoming_tx: Option<mpsc::UnboundedSender<Arc<DataChannel>>>,
    ice_completed: bool,
    ice_failed: bool,
}

struct ConnectionInner {
    state: ConnectionState,
    association: Option<Association>,
    channels: ChannelManager,
    data_handler: Option<DataHandler>,
    expected_fingerprint: Option<String>,
    incoming_tx: Option<mpsc::UnboundedSender<Arc<DataChannel>>>,
}

/// One peer connection: demultiplexes ingress between STUN and DTLS,
/// drives the DTLS collaborator, runs the SCTP association over its
/// application data, and surfaces data channels.
pub struct Connection {
    is_client: bool,
    local_fingerprint: String,
    agent: IceLiteAgent,
    dtls: Arc<dyn DtlsConn>,
    send: SendFn,
    inner: Mutex<ConnectionInner>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<DataChannel>>>>,
}

impl Connection {
    pub(crate) fn new(
        is_client: bool,
        expected_fingerprint: Option<String>,
        local_fingerprint: String,
        dtls: Arc<dyn DtlsConn>,
        send: SendFn,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let role = if is_client {
            ChannelRole::Initiator
        } else {
            ChannelRole::Responder
        };

        Arc::new(Connection {
            is_client,
            local_fingerprint,
            agent: IceLiteAgent::new(),
            dtls,
            send,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::New,
                association: Some(Association::new(AssociationConfig::default())),
                channels: ChannelManager::new(role),
                data_handler: None,
                expected_fingerprint,
                incoming_tx: Some(tx),
            }),
            incoming_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock("state").state.clone()
    }

    pub fn local_fingerprint(&self) -> &str {
        &self.local_fingerprint
    }

    pub fn remote_fingerprint(&self) -> Option<String> {
        self.dtls.remote_fingerprint()
    }

    pub fn ice_credentials(&self) -> Credentials {
        self.agent.credentials()
    }

    pub fn ice_state(&self) -> rivulet_ice::IceLiteState {
        self.agent.state()
    }

    pub fn set_remote_ice_credentials(&self, ufrag: &str, pwd: &str) -> Result<()> {
        self.agent.set_remote_credentials(ufrag, pwd)?;
        Ok(())
    }

    pub fn set_data_handler(&self, handler: DataHandler) {
        self.inner.lock("set_data_handler").data_handler = Some(handler);
    }

    /// The sequence of channels the remote peer opens. Taken once; ends
    /// when the connection closes.
    pub fn incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<DataChannel>>> {
        self.incoming_rx.lock("incoming_channels").take()
    }

    /// Client: produce and send the first DTLS flight. Server: arm and
    /// wait for the peer's flight.
    pub fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock("start");
            if inner.state != ConnectionState::New {
                return Err(Error::ErrInvalidState(inner.state.to_string()));
            }
            inner.state = ConnectionState::Connecting;
        }

        let flights = if self.is_client {
            self.dtls
                .start_handshake()
                .map_err(|e| Error::ErrDtlsHandshakeFailed(e.to_string()))?
        } else {
            vec![]
        };

        {
            let mut inner = self.inner.lock("start");
            if inner.state == ConnectionState::Connecting {
                inner.state = ConnectionState::DtlsHandshaking;
            }
        }

        debug!(
            "[conn] started as {}",
            if self.is_client { "client" } else { "server" }
        );
        for flight in flights {
            (self.send)(&flight);
        }
        Ok(())
    }

    /// Feeds one inbound datagram. STUN handling needs the source address
    /// for the validated-peer set and the XOR-MAPPED-ADDRESS echo.
    pub fn receive(&self, buf: &[u8], remote_addr: Option<SocketAddr>) -> Result<()> {
        if self.state().is_terminal() {
            trace!("[conn] dropping datagram received after terminal state");
            return Ok(());
        }

        match classify(buf) {
            Demux::Stun => self.receive_stun(buf, remote_addr),
            Demux::Dtls => self.receive_dtls(buf),
            Demux::Unknown => {
                warn!(
                    "[conn] dropping datagram with unknown first byte {:?}",
                    buf.first()
                );
                Ok(())
            }
        }
    }

    fn receive_stun(&self, buf: &[u8], remote_addr: Option<SocketAddr>) -> Result<()> {
        let src = match remote_addr {
            Some(src) => src,
            None => {
                warn!("[conn] STUN datagram without a source address, dropping");
                return Ok(());
            }
        };

        // The agent has its own lock; responses are produced synchronously
        // from the request and sent outside of it.
        match self.agent.process_stun(buf, src) {
            Ok(Some(response)) => {
                (self.send)(&response);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(rivulet_ice::error::Error::ErrAgentClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn receive_dtls(&self, buf: &[u8]) -> Result<()> {
        let now = Instant::now();
        // The DTLS collaborator synchronizes itself; keep it outside the
        // connection lock.
        let events = match self.dtls.handle_inbound(buf) {
            Ok(events) => events,
            Err(e) => {
                let reason = format!("DTLS failure: {e}");
                self.fail(&reason);
                return Err(Error::ErrDtlsHandshakeFailed(e.to_string()));
            }
        };

        let mut fx = Effects {
            outgoing: events.outgoing,
            ..Default::default()
        };

        let result = {
            let mut guard = self.inner.lock("receive_dtls");
            let inner = &mut *guard;
            if inner.state.is_terminal() {
                return Ok(());
            }

            let mut result = Ok(());
            if events.handshake_complete
                && matches!(
                    inner.state,
                    ConnectionState::Connecting | ConnectionState::DtlsHandshaking
                )
            {
                result = self.on_handshake_complete(inner, &mut fx);
            }

            if result.is_ok() {
                for data in &events.application_data {
                    self.process_sctp(inner, &Bytes::copy_from_slice(data), now, &mut fx);
                }

                if inner.state == ConnectionState::SctpConnecting
                    && inner
                        .association
                        .as_ref()
                        .is_some_and(|a| a.is_established())
                {
                    debug!("[conn] SCTP established, connection up");
                    inner.state = ConnectionState::Connected;
                }
            }

            fx.handler = inner.data_handler.clone();
            fx.incoming_tx = inner.incoming_tx.clone();
            result
        };

        self.flush(fx);
        result
    }

    /// Runs under the connection lock at the moment DTLS reports
    /// completion: verify the peer fingerprint (client), promote the
    /// state, and start SCTP (client).
    fn on_handshake_complete(
        &self,
        inner: &mut ConnectionInner,
        fx: &mut Effects,
    ) -> Result<()> {
        if let Some(expected) = inner.expected_fingerprint.clone() {
            let actual = self.dtls.remote_fingerprint();
            let matches = actual
                .as_deref()
                .is_some_and(|fp| fp.eq_ignore_ascii_case(&expected));
            if !matches {
                warn!("[conn] remote fingerprint {actual:?} does not match expected value");
                inner.state =
                    ConnectionState::Failed("remote certificate fingerprint mismatch".to_owned());
                inner.incoming_tx = None;
                inner.data_handler = None;
                fx.ice_failed = true;
                return Err(Error::ErrFingerprintMismatch);
            }
        }

        debug!("[conn] DTLS handshake complete, connecting SCTP");
        fx.ice_completed = true;
        inner.state = ConnectionState::SctpConnecting;

        if self.is_client {
            if let Some(assoc) = inner.association.as_mut() {
                let init = assoc.start()?;
                self.encrypt_into(&init, fx);
            }
        }
        Ok(())
    }

    /// Decodes one decrypted datagram as an SCTP packet and routes the
    /// outcome. Undecodable input is dropped with a log line; the
    /// association reported the packet-level checksum already.
    fn process_sctp(
        &self,
        inner: &mut ConnectionInner,
        raw: &Bytes,
        now: Instant,
        fx: &mut Effects,
    ) {
        let ConnectionInner {
            association,
            channels,
            ..
        } = inner;
        let assoc = match association.as_mut() {
            Some(assoc) => assoc,
            None => return,
        };

        let outcome = match assoc.process(raw, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[conn] dropping undecodable SCTP datagram: {e}");
                return;
            }
        };

        for response in outcome.responses {
            self.encrypt_into(&response, fx);
        }

        for msg in outcome.messages {
            match msg.ppi {
                PayloadProtocolIdentifier::Dcep => {
                    match channels.handle_inbound(msg.stream_id, &msg.data) {
                        Ok(result) => {
                            if let Some(reply) = result.reply {
                                match assoc.send(
                                    msg.stream_id,
                                    PayloadProtocolIdentifier::Dcep,
                                    reply,
                                    false,
                                    now,
                                ) {
                                    Ok(packets) => {
                                        for p in packets {
                                            self.encrypt_into(&p, fx);
                                        }
                                    }
                                    Err(e) => warn!("[conn] failed to send DCEP ack: {e}"),
                                }
                            }
                            if let Some(channel) = result.opened {
                                fx.opened.push(channel);
                            }
                        }
                        Err(e) => warn!(
                            "[conn] invalid DCEP message on stream {}: {e}",
                            msg.stream_id
                        ),
                    }
                }
                PayloadProtocolIdentifier::String | PayloadProtocolIdentifier::Binary => {
                    fx.deliveries.push((msg.stream_id, msg.data));
                }
                PayloadProtocolIdentifier::StringEmpty | PayloadProtocolIdentifier::BinaryEmpty => {
                    fx.deliveries.push((msg.stream_id, Bytes::new()));
                }
                PayloadProtocolIdentifier::Unknown => {
                    warn!(
                        "[conn] dropping message with unknown PPID on stream {}",
                        msg.stream_id
                    );
                }
            }
        }
    }

    /// Opens an outbound data channel; the handle starts `Connecting` and
    /// opens when the peer acknowledges.
    pub fn open_data_channel(&self, label: &str, ordered: bool) -> Result<Arc<DataChannel>> {
        let now = Instant::now();
        let mut fx = Effects::default();

        let channel = {
            let mut guard = self.inner.lock("open_data_channel");
            let inner = &mut *guard;
            if inner.state != ConnectionState::Connected {
                return Err(Error::ErrInvalidState(inner.state.to_string()));
            }

            let (channel, open_payload) = inner.channels.open_channel(label, "", ordered)?;
            let assoc = inner
                .association
                .as_mut()
                .ok_or(Error::ErrClosed)?;
            let packets = assoc.send(
                channel.stream_id(),
                PayloadProtocolIdentifier::Dcep,
                open_payload,
                false,
                now,
            )?;
            for p in packets {
                self.encrypt_into(&p, &mut fx);
            }
            channel
        };

        self.flush(fx);
        Ok(channel)
    }

    /// Sends one message on an open channel. Empty payloads travel as the
    /// single placeholder byte under the empty PPIDs (RFC 8831 §6.6).
    pub fn send(&self, payload: &[u8], stream_id: u16, binary: bool) -> Result<()> {
        let now = Instant::now();
        let mut fx = Effects::default();

        {
            let mut guard = self.inner.lock("send");
            let inner = &mut *guard;
            if inner.state != ConnectionState::Connected {
                return Err(Error::ErrInvalidState(inner.state.to_string()));
            }

            let channel = inner
                .channels
                .channel(stream_id)
                .ok_or(Error::ErrChannelNotOpen)?;
            if !channel.is_open() {
                return Err(Error::ErrChannelNotOpen);
            }

            let (ppi, data) = match (payload.is_empty(), binary) {
                (true, true) => (
                    PayloadProtocolIdentifier::BinaryEmpty,
                    Bytes::from_static(&[0]),
                ),
                (true, false) => (
                    PayloadProtocolIdentifier::StringEmpty,
                    Bytes::from_static(&[0]),
                ),
                (false, true) => (
                    PayloadProtocolIdentifier::Binary,
                    Bytes::copy_from_slice(payload),
                ),
                (false, false) => (
                    PayloadProtocolIdentifier::String,
                    Bytes::copy_from_slice(payload),
                ),
            };

            let assoc = inner.association.as_mut().ok_or(Error::ErrClosed)?;
            let packets = assoc.send(stream_id, ppi, data, !channel.ordered(), now)?;
            for p in packets {
                self.encrypt_into(&p, &mut fx);
            }
        }

        self.flush(fx);
        Ok(())
    }

    /// Timer hook: re-sends whatever the association considers due. An
    /// exhausted retransmission budget fails the connection.
    pub fn drive_retransmissions(&self, now: Instant) -> Result<()> {
        let mut fx = Effects::default();

        {
            let mut guard = self.inner.lock("drive_retransmissions");
            let inner = &mut *guard;
            if inner.state.is_terminal() {
                return Ok(());
            }
            let assoc = match inner.association.as_mut() {
                Some(assoc) => assoc,
                None => return Ok(()),
            };

            match assoc.pending_retransmissions(now) {
                Ok(packets) => {
                    for p in packets {
                        self.encrypt_into(&p, &mut fx);
                    }
                }
                Err(e) => {
                    warn!("[conn] retransmission gave up: {e}");
                    inner.state = ConnectionState::Failed(e.to_string());
                    inner.incoming_tx = None;
                    inner.data_handler = None;
                    fx.ice_failed = true;
                    self.flush(fx);
                    return Err(e.into());
                }
            }
        }

        self.flush(fx);
        Ok(())
    }

    /// Cooperative close: terminal state, completed sequences, cleared
    /// handler, SHUTDOWN towards the peer when the association was up.
    pub fn close(&self) {
        let mut fx = Effects::default();

        {
            let mut guard = self.inner.lock("close");
            let inner = &mut *guard;
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Closed;
            inner.incoming_tx = None;
            inner.data_handler = None;
            inner.channels.close();

            if let Some(assoc) = inner.association.as_mut() {
                match assoc.close() {
                    Ok(Some(shutdown)) => self.encrypt_into(&shutdown, &mut fx),
                    Ok(None) => {}
                    Err(e) => warn!("[conn] association close: {e}"),
                }
            }
        }

        self.agent.close();
        debug!("[conn] closed");
        self.flush(fx);
    }

    fn fail(&self, reason: &str) {
        let mut inner = self.inner.lock("fail");
        if !inner.state.is_terminal() {
            inner.state = ConnectionState::Failed(reason.to_owned());
            inner.incoming_tx = None;
            inner.data_handler = None;
        }
        drop(inner);
        self.agent.fail();
    }

    fn encrypt_into(&self, plaintext: &Bytes, fx: &mut Effects) {
        match self.dtls.encrypt(plaintext) {
            Ok(records) => fx.outgoing.extend(records),
            Err(e) => warn!("[conn] DTLS encrypt failed: {e}"),
        }
    }

    /// Performs the side effects gathered under the lock, now that it is
    /// released: wire writes first, then data deliveries, then channel
    /// announcements.
    fn flush(&self, fx: Effects) {
        if fx.ice_completed {
            self.agent.complete();
        }
        if fx.ice_failed {
            self.agent.fail();
        }

        for datagram in &fx.outgoing {
            (self.send)(datagram);
        }

        if let Some(handler) = &fx.handler {
            for (stream_id, payload) in &fx.deliveries {
                handler(*stream_id, payload);
            }
        } else if !fx.deliveries.is_empty() {
            trace!(
                "[conn] no data handler set, dropping {} messages",
                fx.deliveries.len()
            );
        }

        if let Some(tx) = &fx.incoming_tx {
            for channel in fx.opened {
                let _ = tx.send(channel);
            }
        }
    }
}
