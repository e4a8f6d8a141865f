use std::fmt;
use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// A DTLS certificate handle. The TLS internals live in the transport
/// implementation; the core only needs the SHA-256 fingerprint in the
/// uppercase colon-separated form exchanged via signaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    fingerprint: String,
}

impl Certificate {
    /// Wraps a fingerprint computed elsewhere (e.g. by the DTLS library
    /// that owns the actual key pair).
    pub fn from_fingerprint(fingerprint: String) -> Self {
        Certificate { fingerprint }
    }

    /// Derives a certificate handle from fresh random key material.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed);
        let digest = Sha256::digest(seed);
        let fingerprint = digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        Certificate { fingerprint }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fingerprint)
    }
}

/// What feeding one datagram into the DTLS layer produced.
#[derive(Debug, Default)]
pub struct DtlsEvents {
    /// Records to put on the wire.
    pub outgoing: Vec<Vec<u8>>,
    /// Set on the datagram that completed the handshake.
    pub handshake_complete: bool,
    /// Decrypted application data, zero or more messages.
    pub application_data: Vec<Vec<u8>>,
}

/// The DTLS record and handshake layer, as seen by the connection. The
/// core never parses TLS: it demultiplexes, feeds datagrams in, encrypts
/// application data out, and reads the peer fingerprint once the
/// handshake finished. Implementations carry their own synchronization.
pub trait DtlsConn: Send + Sync {
    /// Produces the initial client flight (empty for the server role).
    fn start_handshake(&self) -> Result<Vec<Vec<u8>>>;

    /// Feeds one inbound datagram from the DTLS range.
    fn handle_inbound(&self, datagram: &[u8]) -> Result<DtlsEvents>;

    /// Encrypts application data into zero or more records.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// The peer certificate fingerprint, once the handshake produced one.
    fn remote_fingerprint(&self) -> Option<String>;
}

/// Vends one DTLS transport per connection.
pub trait DtlsFactory: Send + Sync {
    fn create(&self, is_client: bool, certificate: &Certificate) -> Arc<dyn DtlsConn>;
}
