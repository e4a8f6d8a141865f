use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use crate::connection::{Connection, SendFn};
use crate::dtls::{Certificate, DtlsFactory};
use crate::error::{Error, Result};
use crate::mutex::Mutex;

struct ListenerInner {
    connections: HashMap<String, Arc<Connection>>,
    incoming_tx: Option<mpsc::UnboundedSender<Arc<Connection>>>,
    closed: bool,
}

/// Listener accepts server-side connections, one per peer id, and
/// publishes each new one on the incoming-connections sequence.
pub struct Listener {
    certificate: Certificate,
    factory: Arc<dyn DtlsFactory>,
    inner: Mutex<ListenerInner>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Connection>>>>,
}

impl Listener {
    pub(crate) fn new(certificate: Certificate, factory: Arc<dyn DtlsFactory>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Listener {
            certificate,
            factory,
            inner: Mutex::new(ListenerInner {
                connections: HashMap::new(),
                incoming_tx: Some(tx),
                closed: false,
            }),
            incoming_rx: Mutex::new(Some(rx)),
        })
    }

    pub fn local_fingerprint(&self) -> &str {
        self.certificate.fingerprint()
    }

    /// The sequence of accepted connections. Taken once; ends on close.
    pub fn connections(&self) -> Option<mpsc::UnboundedReceiver<Arc<Connection>>> {
        self.incoming_rx.lock("connections").take()
    }

    /// Returns the connection registered for `peer_id`, creating and
    /// publishing a server connection when none exists yet.
    pub fn accept_connection(&self, peer_id: &str, send: SendFn) -> Result<Arc<Connection>> {
        let (connection, publish_tx) = {
            let mut inner = self.inner.lock("accept_connection");
            if inner.closed {
                return Err(Error::ErrListenerClosed);
            }
            if let Some(existing) = inner.connections.get(peer_id) {
                return Ok(existing.clone());
            }

            let dtls = self.factory.create(false, &self.certificate);
            let connection = Connection::new(
                false,
                None,
                self.certificate.fingerprint().to_owned(),
                dtls,
                send,
            );
            inner
                .connections
                .insert(peer_id.to_owned(), connection.clone());
            debug!("[listener] accepted connection for peer {peer_id:?}");
            (connection, inner.incoming_tx.clone())
        };

        if let Some(tx) = publish_tx {
            let _ = tx.send(connection.clone());
        }
        Ok(connection)
    }

    pub fn connection(&self, peer_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .lock("connection")
            .connections
            .get(peer_id)
            .cloned()
    }

    /// Closes and unregisters the connection for `peer_id`.
    pub fn remove_connection(&self, peer_id: &str) {
        let removed = self
            .inner
            .lock("remove_connection")
            .connections
            .remove(peer_id);
        if let Some(connection) = removed {
            connection.close();
        }
    }

    /// Closes every connection and completes the sequence.
    pub fn close(&self) {
        let connections = {
            let mut inner = self.inner.lock("close");
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.incoming_tx = None;
            inner.connections.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };
        for connection in connections {
            connection.close();
        }
        debug!("[listener] closed");
    }
}
