use std::sync::Arc;

use crate::connection::{Connection, SendFn};
use crate::dtls::{Certificate, DtlsFactory};
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::mutex::Mutex;

#[derive(Default)]
struct EndpointInner {
    connections: Vec<Arc<Connection>>,
    listeners: Vec<Arc<Listener>>,
    closed: bool,
}

/// Endpoint owns the certificate and vends client connections and
/// listeners that share it. Closing the endpoint closes everything it
/// vended.
pub struct Endpoint {
    certificate: Certificate,
    factory: Arc<dyn DtlsFactory>,
    inner: Mutex<EndpointInner>,
}

impl Endpoint {
    /// Creates an endpoint with a freshly generated certificate.
    pub fn new(factory: Arc<dyn DtlsFactory>) -> Self {
        Self::with_certificate(factory, Certificate::generate())
    }

    /// Creates an endpoint around an existing certificate.
    pub fn with_certificate(factory: Arc<dyn DtlsFactory>, certificate: Certificate) -> Self {
        Endpoint {
            certificate,
            factory,
            inner: Mutex::new(EndpointInner::default()),
        }
    }

    pub fn local_fingerprint(&self) -> &str {
        self.certificate.fingerprint()
    }

    /// Opens a client connection towards a peer whose certificate
    /// fingerprint is already known from signaling.
    pub fn connect(&self, remote_fingerprint: &str, send: SendFn) -> Result<Arc<Connection>> {
        let mut inner = self.inner.lock("connect");
        if inner.closed {
            return Err(Error::ErrEndpointClosed);
        }

        let dtls = self.factory.create(true, &self.certificate);
        let connection = Connection::new(
            true,
            Some(remote_fingerprint.to_owned()),
            self.certificate.fingerprint().to_owned(),
            dtls,
            send,
        );
        inner.connections.push(connection.clone());
        Ok(connection)
    }

    /// Creates a listener sharing this endpoint's certificate.
    pub fn listen(&self) -> Result<Arc<Listener>> {
        let mut inner = self.inner.lock("listen");
        if inner.closed {
            return Err(Error::ErrEndpointClosed);
        }

        let listener = Listener::new(self.certificate.clone(), self.factory.clone());
        inner.listeners.push(listener.clone());
        Ok(listener)
    }

    /// Closes every vended connection and listener.
    pub fn close(&self) {
        let (connections, listeners) = {
            let mut inner = self.inner.lock("close");
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.connections),
                std::mem::take(&mut inner.listeners),
            )
        };

        for connection in connections {
            connection.close();
        }
        for listener in listeners {
            listener.close();
        }
    }
}
