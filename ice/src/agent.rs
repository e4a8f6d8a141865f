
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Mutex;

use log::{debug, trace, warn};

use rivulet_stun::attributes::*;
use rivulet_stun::error_code::ErrorCode;
use rivulet_stun::fingerprint::FINGERPRINT;
use rivulet_stun::integrity::{IntegrityResult, MessageIntegrity};
use rivulet_stun::message::*;
use rivulet_stun::textattrs::TextAttribute;
use rivulet_stun::xoraddr::XorMappedAddress;

use crate::error::*;
use crate::rand::{generate_pwd, generate_ufrag};
use crate::state::IceLiteState;

/// Short-term credentials for one side of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
}

impl Credentials {
    pub fn new() -> Self {
        Credentials {
            ufrag: generate_ufrag(),
            pwd: generate_pwd(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct AgentInner {
    local: Credentials,
    remote: Option<Credentials>,
    state: IceLiteState,
    validated_peers: HashSet<SocketAddr>,
}

/// An ICE-Lite agent: always controlled, never initiates checks. It
/// validates inbound binding requests against the local credentials and
/// answers with XOR-MAPPED-ADDRESS, signed and fingerprinted.
pub struct IceLiteAgent {
    inner: Mutex<AgentInner>,
}

impl Default for IceLiteAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl IceLiteAgent {
    pub fn new() -> Self {
        IceLiteAgent {
            inner: Mutex::new(AgentInner {
                local: Credentials::new(),
                ..Default::default()
            }),
        }
    }

    pub fn credentials(&self) -> Credentials {
        self.inner.lock().unwrap().local.clone()
    }

    pub fn state(&self) -> IceLiteState {
        self.inner.lock().unwrap().state
    }

    /// Remote credentials arrive once, out of band via signaling.
    pub fn set_remote_credentials(&self, ufrag: &str, pwd: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == IceLiteState::Closed {
            return Err(Error::ErrAgentClosed);
        }
        if inner.remote.is_some() {
            return Err(Error::ErrRemoteCredentialsAlreadySet);
        }
        inner.remote = Some(Credentials {
            ufrag: ufrag.to_owned(),
            pwd: pwd.to_owned(),
        });
        if inner.state == IceLiteState::New {
            inner.state = IceLiteState::Checking;
        }
        Ok(())
    }

    pub fn validated_peers(&self) -> Vec<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        inner.validated_peers.iter().copied().collect()
    }

    pub fn is_validated(&self, addr: &SocketAddr) -> bool {
        self.inner.lock().unwrap().validated_peers.contains(addr)
    }

    /// Signal from the orchestrator once the DTLS handshake finished.
    pub fn complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == IceLiteState::Connected {
            inner.state = IceLiteState::Completed;
        }
    }

    pub fn fail(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_terminal() {
            inner.state = IceLiteState::Failed;
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = IceLiteState::Closed;
        inner.validated_peers.clear();
    }

    /// Handles one inbound datagram that may be a STUN binding request.
    /// Returns the encoded response, or `None` when the datagram is not a
    /// binding request at all. Validation failures yield error responses.
    pub fn process_stun(&self, buf: &[u8], src: SocketAddr) -> Result<Option<Vec<u8>>> {
        if !is_message(buf) {
            return Ok(None);
        }

        let mut m = Message::new();
        if let Err(e) = m.unmarshal_binary(buf) {
            trace!("[ice] dropping undecodable datagram from {src}: {e}");
            return Ok(None);
        }
        if m.typ != BINDING_REQUEST {
            trace!("[ice] ignoring {} from {src}", m.typ);
            return Ok(None);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.state == IceLiteState::Closed {
            return Err(Error::ErrAgentClosed);
        }

        match Self::validate_binding_request(&inner, &mut m) {
            Ok(()) => {
                inner.validated_peers.insert(src);
                if matches!(inner.state, IceLiteState::New | IceLiteState::Checking) {
                    debug!("[ice] first validated check from {src}, agent connected");
                    inner.state = IceLiteState::Connected;
                }
                let resp = Self::build_success_response(&inner.local.pwd, &m, src)?;
                Ok(Some(resp))
            }
            Err(e) => {
                warn!("[ice] binding request from {src} rejected: {e}");
                match e.error_code() {
                    Some(code) => {
                        let resp = Self::build_error_response(&inner.local.pwd, &m, code)?;
                        Ok(Some(resp))
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// The validation pipeline for an inbound check, in order: USERNAME
    /// shape and local-ufrag match, FINGERPRINT (when present),
    /// MESSAGE-INTEGRITY over the local password, role conflict.
    fn validate_binding_request(inner: &AgentInner, m: &mut Message) -> Result<()> {
        let username = match TextAttribute::get_from_as(m, ATTR_USERNAME) {
            Ok(u) => u.text,
            Err(rivulet_stun::error::Error::ErrAttributeNotFound) => {
                return Err(Error::ErrMissingUsername)
            }
            Err(_) => return Err(Error::ErrInvalidUsernameFormat),
        };
        // USERNAME is remoteUfrag:localUfrag from the sender's point of
        // view; the receiver owns the second half.
        let (_, local_part) = username
            .split_once(':')
            .ok_or(Error::ErrInvalidUsernameFormat)?;
        if local_part != inner.local.ufrag {
            return Err(Error::ErrLocalUfragMismatch);
        }

        if m.contains(ATTR_FINGERPRINT) && FINGERPRINT.check(m).is_err() {
            return Err(Error::ErrFingerprintVerificationFailed);
        }

        let integrity = MessageIntegrity::new_short_term_integrity(&inner.local.pwd);
        match integrity.verify(m) {
            IntegrityResult::Valid => {}
            IntegrityResult::Missing => return Err(Error::ErrMissingMessageIntegrity),
            IntegrityResult::Invalid => return Err(Error::ErrInvalidMessageIntegrity),
        }

        // We are always controlled; a peer claiming the controlled role
        // as well is a conflict (RFC 8445 §7.3.1.1).
        if m.contains(ATTR_ICE_CONTROLLED) {
            return Err(Error::ErrRoleConflict);
        }

        Ok(())
    }

    fn build_success_response(pwd: &str, req: &Message, src: SocketAddr) -> Result<Vec<u8>> {
        let mut resp = Message::new();
        resp.build(&[
            &BINDING_SUCCESS,
            &req.transaction_id,
            &XorMappedAddress {
                ip: src.ip(),
                port: src.port(),
            },
            &MessageIntegrity::new_short_term_integrity(pwd),
            &FINGERPRINT,
        ])?;
        Ok(resp.raw)
    }

    fn build_error_response(pwd: &str, req: &Message, code: ErrorCode) -> Result<Vec<u8>> {
        let mut resp = Message::new();
        resp.build(&[
            &BINDING_ERROR,
            &req.transaction_id,
            &code,
            &MessageIntegrity::new_short_term_integrity(pwd),
            &FINGERPRINT,
        ])?;
        Ok(resp.raw)
    }
}
