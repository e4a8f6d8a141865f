use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rivulet::{
    Certificate, ChannelState, Connection, ConnectionState, DtlsConn, DtlsEvents, DtlsFactory,
    Endpoint, Error, IceLiteState, SendFn,
};

const RECORD_HANDSHAKE: u8 = 22;
const RECORD_APPDATA: u8 = 23;

const FLIGHT_HELLO: u8 = 0x01;
const FLIGHT_DONE: u8 = 0x02;

/// A plaintext stand-in for the DTLS collaborator: a two-flight
/// handshake that carries each side's certificate fingerprint, and
/// "encryption" that frames application data behind an application-data
/// record byte. Lets the test drive the real demultiplexer, SCTP engine
/// and DCEP exchange over loopback queues.
struct PassthroughDtls {
    is_client: bool,
    local_fingerprint: String,
    peer_fingerprint: Mutex<Option<String>>,
}

impl DtlsConn for PassthroughDtls {
    fn start_handshake(&self) -> rivulet::Result<Vec<Vec<u8>>> {
        let mut flight = vec![RECORD_HANDSHAKE, FLIGHT_HELLO];
        flight.extend_from_slice(self.local_fingerprint.as_bytes());
        Ok(vec![flight])
    }

    fn handle_inbound(&self, datagram: &[u8]) -> rivulet::Result<DtlsEvents> {
        let mut events = DtlsEvents::default();
        match datagram.first() {
            Some(&RECORD_HANDSHAKE) => {
                let fp = String::from_utf8(datagram[2..].to_vec()).unwrap();
                *self.peer_fingerprint.lock().unwrap() = Some(fp);
                events.handshake_complete = true;
                if !self.is_client {
                    let mut reply = vec![RECORD_HANDSHAKE, FLIGHT_DONE];
                    reply.extend_from_slice(self.local_fingerprint.as_bytes());
                    events.outgoing.push(reply);
                }
            }
            Some(&RECORD_APPDATA) => {
                events.application_data.push(datagram[1..].to_vec());
            }
            _ => {}
        }
        Ok(events)
    }

    fn encrypt(&self, plaintext: &[u8]) -> rivulet::Result<Vec<Vec<u8>>> {
        let mut record = vec![RECORD_APPDATA];
        record.extend_from_slice(plaintext);
        Ok(vec![record])
    }

    fn remote_fingerprint(&self) -> Option<String> {
        self.peer_fingerprint.lock().unwrap().clone()
    }
}

struct PassthroughFactory;

impl DtlsFactory for PassthroughFactory {
    fn create(&self, is_client: bool, certificate: &Certificate) -> Arc<dyn DtlsConn> {
        Arc::new(PassthroughDtls {
            is_client,
            local_fingerprint: certificate.fingerprint().to_owned(),
            peer_fingerprint: Mutex::new(None),
        })
    }
}

type Wire = Arc<Mutex<VecDeque<Vec<u8>>>>;

fn wire_pair() -> (Wire, Wire, SendFn, SendFn) {
    let to_server: Wire = Arc::new(Mutex::new(VecDeque::new()));
    let to_client: Wire = Arc::new(Mutex::new(VecDeque::new()));

    let client_send: SendFn = {
        let q = to_server.clone();
        Arc::new(move |datagram: &[u8]| {
            q.lock().unwrap().push_back(datagram.to_vec());
        })
    };
    let server_send: SendFn = {
        let q = to_client.clone();
        Arc::new(move |datagram: &[u8]| {
            q.lock().unwrap().push_back(datagram.to_vec());
        })
    };

    (to_server, to_client, client_send, server_send)
}

/// Shuttles queued datagrams between the two connections until the wire
/// goes quiet.
fn pump(
    client: &Connection,
    server: &Connection,
    to_server: &Wire,
    to_client: &Wire,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
) {
    loop {
        let for_server: Vec<Vec<u8>> = to_server.lock().unwrap().drain(..).collect();
        let for_client: Vec<Vec<u8>> = to_client.lock().unwrap().drain(..).collect();
        if for_server.is_empty() && for_client.is_empty() {
            break;
        }
        for datagram in for_server {
            let _ = server.receive(&datagram, Some(client_addr));
        }
        for datagram in for_client {
            let _ = client.receive(&datagram, Some(server_addr));
        }
    }
}

struct Stack {
    client: Arc<Connection>,
    server: Arc<Connection>,
    to_server: Wire,
    to_client: Wire,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
}

impl Stack {
    fn pump(&self) {
        pump(
            &self.client,
            &self.server,
            &self.to_server,
            &self.to_client,
            self.client_addr,
            self.server_addr,
        );
    }
}

/// Brings up a connected client/server pair over loopback queues.
fn connected_stack() -> Stack {
    let factory = Arc::new(PassthroughFactory);
    let client_endpoint = Endpoint::new(factory.clone());
    let server_endpoint = Endpoint::new(factory);

    let (to_server, to_client, client_send, server_send) = wire_pair();

    let listener = server_endpoint.listen().unwrap();
    let server = listener
        .accept_connection("client-1", server_send)
        .unwrap();
    let client = client_endpoint
        .connect(server_endpoint.local_fingerprint(), client_send)
        .unwrap();

    // Exchange ICE credentials the way signaling would.
    let client_creds = client.ice_credentials();
    let server_creds = server.ice_credentials();
    client
        .set_remote_ice_credentials(&server_creds.ufrag, &server_creds.pwd)
        .unwrap();
    server
        .set_remote_ice_credentials(&client_creds.ufrag, &client_creds.pwd)
        .unwrap();

    server.start().unwrap();
    client.start().unwrap();

    let stack = Stack {
        client,
        server,
        to_server,
        to_client,
        client_addr: "192.168.1.1:5000".parse().unwrap(),
        server_addr: "192.168.1.2:6000".parse().unwrap(),
    };
    stack.pump();
    stack
}

#[test]
fn test_connection_reaches_connected() {
    let stack = connected_stack();
    assert_eq!(stack.client.state(), ConnectionState::Connected);
    assert_eq!(stack.server.state(), ConnectionState::Connected);
    assert_eq!(
        stack.client.remote_fingerprint().as_deref(),
        Some(stack.server.local_fingerprint())
    );
}

#[test]
fn test_open_channel_and_exchange_data() {
    let stack = connected_stack();

    let server_received: Arc<Mutex<Vec<(u16, Vec<u8>)>>> = Arc::new(Mutex::new(vec![]));
    let client_received: Arc<Mutex<Vec<(u16, Vec<u8>)>>> = Arc::new(Mutex::new(vec![]));
    {
        let sink = server_received.clone();
        stack.server.set_data_handler(Arc::new(move |stream_id, payload| {
            sink.lock().unwrap().push((stream_id, payload.to_vec()));
        }));
    }
    {
        let sink = client_received.clone();
        stack.client.set_data_handler(Arc::new(move |stream_id, payload| {
            sink.lock().unwrap().push((stream_id, payload.to_vec()));
        }));
    }

    let mut server_channels = stack.server.incoming_channels().unwrap();

    // Client (initiator) opens stream 0; OPEN/ACK completes over the wire.
    let channel = stack.client.open_data_channel("chat", true).unwrap();
    assert_eq!(channel.stream_id(), 0);
    assert_eq!(channel.state(), ChannelState::Connecting);
    stack.pump();
    assert_eq!(channel.state(), ChannelState::Open);

    let remote_channel = server_channels.try_recv().expect("server sees the channel");
    assert_eq!(remote_channel.stream_id(), 0);
    assert_eq!(remote_channel.label(), "chat");
    assert!(remote_channel.is_open());

    // Client to server.
    stack.client.send(b"ping", 0, true).unwrap();
    stack.pump();
    assert_eq!(
        server_received.lock().unwrap().as_slice(),
        &[(0u16, b"ping".to_vec())]
    );

    // Server to client on the same stream.
    stack.server.send(b"pong", 0, false).unwrap();
    stack.pump();
    assert_eq!(
        client_received.lock().unwrap().as_slice(),
        &[(0u16, b"pong".to_vec())]
    );
}

#[test]
fn test_large_message_fragments_across_mtu() {
    let stack = connected_stack();

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(vec![]));
    {
        let sink = received.clone();
        stack.server.set_data_handler(Arc::new(move |_, payload| {
            sink.lock().unwrap().push(payload.to_vec());
        }));
    }

    let channel = stack.client.open_data_channel("bulk", true).unwrap();
    stack.pump();

    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    stack
        .client
        .send(&big, channel.stream_id(), true)
        .unwrap();
    stack.pump();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], big);
}

#[test]
fn test_stun_binding_request_answered() {
    use rivulet_ice::control::AttrControlling;
    use rivulet_ice::priority::PriorityAttr;
    use rivulet_stun::attributes::ATTR_USERNAME;
    use rivulet_stun::fingerprint::FINGERPRINT;
    use rivulet_stun::integrity::{IntegrityResult, MessageIntegrity};
    use rivulet_stun::message::*;
    use rivulet_stun::textattrs::TextAttribute;
    use rivulet_stun::xoraddr::XorMappedAddress;

    let stack = connected_stack();
    let server_creds = stack.server.ice_credentials();
    let client_creds = stack.client.ice_credentials();

    // A connectivity check as a full agent would send it.
    let mut request = Message::new();
    request
        .build(&[
            &BINDING_REQUEST,
            &TransactionId::new(),
            &TextAttribute::new(
                ATTR_USERNAME,
                format!("{}:{}", client_creds.ufrag, server_creds.ufrag),
            ),
            &PriorityAttr(0x6e7f1eff),
            &AttrControlling(777),
            &MessageIntegrity::new_short_term_integrity(&server_creds.pwd),
            &FINGERPRINT,
        ])
        .unwrap();

    stack
        .server
        .receive(&request.raw, Some(stack.client_addr))
        .unwrap();

    // The response went out on the server's wire.
    let response_raw = stack.to_client.lock().unwrap().pop_back().unwrap();
    let mut response = Message::new();
    response.unmarshal_binary(&response_raw).unwrap();
    assert_eq!(response.typ, BINDING_SUCCESS);
    assert_eq!(response.transaction_id, request.transaction_id);

    let mut mapped = XorMappedAddress::default();
    mapped.get_from(&response).unwrap();
    assert_eq!(mapped.ip, stack.client_addr.ip());
    assert_eq!(mapped.port, stack.client_addr.port());

    let key = MessageIntegrity::new_short_term_integrity(&server_creds.pwd);
    assert_eq!(key.verify(&mut response), IntegrityResult::Valid);
}

#[test]
fn test_fingerprint_mismatch_fails_connection() {
    let factory = Arc::new(PassthroughFactory);
    let client_endpoint = Endpoint::new(factory.clone());
    let server_endpoint = Endpoint::new(factory);

    let (to_server, to_client, client_send, server_send) = wire_pair();

    let listener = server_endpoint.listen().unwrap();
    let server = listener.accept_connection("peer", server_send).unwrap();
    // Expect a fingerprint that is not the server's.
    let client = client_endpoint
        .connect(Certificate::generate().fingerprint(), client_send)
        .unwrap();

    server.start().unwrap();
    client.start().unwrap();

    // First flight reaches the server fine.
    let flight = to_server.lock().unwrap().pop_front().unwrap();
    server.receive(&flight, None).unwrap();

    // The server's answer completes the client handshake and trips the
    // fingerprint check.
    let reply = to_client.lock().unwrap().pop_front().unwrap();
    let err = client.receive(&reply, None).unwrap_err();
    assert_eq!(err, Error::ErrFingerprintMismatch);
    assert!(matches!(client.state(), ConnectionState::Failed(_)));

    // Terminal state sticks; later traffic is ignored.
    client.receive(&[23, 1, 2, 3], None).unwrap();
    assert!(matches!(client.state(), ConnectionState::Failed(_)));
}

#[test]
fn test_send_requires_connected_state() {
    let factory = Arc::new(PassthroughFactory);
    let endpoint = Endpoint::new(factory);
    let (_, _, client_send, _) = wire_pair();
    let client = endpoint.connect("AA:BB", client_send).unwrap();

    assert!(matches!(
        client.send(b"early", 0, true),
        Err(Error::ErrInvalidState(_))
    ));
    assert!(matches!(
        client.open_data_channel("early", true),
        Err(Error::ErrInvalidState(_))
    ));
}

#[test]
fn test_close_completes_sequences_and_blocks_send() {
    let stack = connected_stack();
    let channel = stack.client.open_data_channel("c", true).unwrap();
    stack.pump();
    assert!(channel.is_open());

    let mut incoming = stack.client.incoming_channels().unwrap();
    stack.client.close();

    assert_eq!(stack.client.state(), ConnectionState::Closed);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(stack.client.ice_state(), IceLiteState::Closed);
    assert!(matches!(
        incoming.try_recv(),
        Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
    ));
    assert!(matches!(
        stack.client.send(b"late", 0, true),
        Err(Error::ErrInvalidState(_))
    ));

    // The SHUTDOWN went out to the peer.
    stack.pump();
}

#[test]
fn test_listener_registry() {
    let factory = Arc::new(PassthroughFactory);
    let endpoint = Endpoint::new(factory);
    let listener = endpoint.listen().unwrap();
    let mut incoming = listener.connections().unwrap();

    let (_, _, _, server_send) = wire_pair();
    let first = listener
        .accept_connection("peer-a", server_send.clone())
        .unwrap();
    let again = listener
        .accept_connection("peer-a", server_send.clone())
        .unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    // Published exactly once.
    assert!(incoming.try_recv().is_ok());
    assert!(incoming.try_recv().is_err());

    assert!(listener.connection("peer-a").is_some());
    listener.remove_connection("peer-a");
    assert!(listener.connection("peer-a").is_none());
    assert_eq!(first.state(), ConnectionState::Closed);

    listener.close();
    assert!(matches!(
        listener.accept_connection("peer-b", server_send),
        Err(Error::ErrListenerClosed)
    ));
}

#[test]
fn test_endpoint_close_propagates() {
    let stack = connected_stack();
    // Closing one side's connection directly; the peer half keeps its own
    // state machine until it too is closed.
    stack.client.close();
    stack.pump();
    assert_eq!(stack.client.state(), ConnectionState::Closed);
}
