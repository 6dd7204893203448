//! Connection multiplexer
//!
//! A server accepts any number of transports. Each one that negotiated the
//! expected sub-protocol gets its own [`Peer`] (connection, dispatcher and
//! correlation table) and joins the live connection set until it closes.
//! Handlers and the remote subscriber set are shared by every connection.

use crate::dispatcher::Dispatcher;
use crate::subscription::ConnectionId;
use crate::{Handler, HandlerRegistry, Peer, RpcError, ServerConfig, SubscriberSet};
use nmmes_rpc_proto::Args;
use nmmes_rpc_transport::{
    Connection, EventKind, MemoryListener, TransportEvent, TransportHandle,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

struct ServerInner {
    config: ServerConfig,
    handlers: HandlerRegistry,
    subscribers: SubscriberSet,
    connections: RwLock<HashMap<ConnectionId, Arc<Peer>>>,
}

impl ServerInner {
    fn remove(&self, id: ConnectionId) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            info!("Connection {} closed", id);
        }
    }
}

/// Server endpoint
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Server {
    /// Create a server
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                handlers: HandlerRegistry::new(),
                subscribers: SubscriberSet::new(),
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Answer calls to `namespace` from any connection
    pub fn register<H: Handler>(&self, namespace: impl Into<String>, handler: H) {
        self.inner.handlers.register(namespace, handler);
    }

    /// Remove a handler
    pub fn unregister(&self, namespace: &str) -> bool {
        self.inner.handlers.unregister(namespace)
    }

    /// Take over an accepted transport.
    ///
    /// A transport that did not negotiate the configured sub-protocol is
    /// handed back untouched.
    pub fn accept(&self, handle: TransportHandle) -> Result<Arc<Peer>, TransportHandle> {
        let protocol = handle.protocol();
        if protocol.as_deref() != Some(self.inner.config.protocol.as_str()) {
            warn!(
                "Leaving connection unmanaged: expected protocol {}, got {:?}",
                self.inner.config.protocol, protocol
            );
            return Err(handle);
        }

        let id = ConnectionId::new();
        let connection = Connection::from_transport(handle);
        let dispatcher = Dispatcher::attach(
            id,
            connection.clone(),
            self.inner.handlers.clone(),
            self.inner.subscribers.clone(),
            self.inner.config.endpoint.clone(),
        );

        // Accepted connections never reconnect, so any close is final
        let server: Weak<ServerInner> = Arc::downgrade(&self.inner);
        connection.add_listener(EventKind::Close, move |_| {
            if let Some(server) = server.upgrade() {
                server.remove(id);
            }
        });

        let peer = Arc::new(Peer::new(dispatcher));
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, peer.clone());
        connection.start();
        info!("Accepted connection {} from {}", id, connection.target());

        Ok(peer)
    }

    /// Snapshot of the live connections
    pub fn connections(&self) -> Vec<Arc<Peer>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Look up a live connection
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Peer>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Connections subscribed to `namespace`
    pub fn subscribers(&self, namespace: &str) -> Vec<ConnectionId> {
        self.inner.subscribers.subscribers(namespace)
    }

    /// Publish to every open connection subscribed to `namespace`.
    ///
    /// Returns the number of connections the publish was sent to.
    pub fn publish(&self, namespace: &str, data: Args) -> Result<usize, RpcError> {
        let peers: Vec<Arc<Peer>> = self
            .subscribers(namespace)
            .into_iter()
            .filter_map(|id| self.connection(id))
            .collect();

        let mut sent = 0;
        for peer in peers {
            if peer.publish(namespace, data.clone())? {
                sent += 1;
            }
        }
        debug!("Published {} to {} connections", namespace, sent);
        Ok(sent)
    }

    /// Accept in-memory transports until the listener's connectors are gone
    pub async fn serve_memory(&self, mut listener: MemoryListener) {
        while let Some(handle) = listener.accept().await {
            if let Err(handle) = self.accept(handle) {
                ignore(handle);
            }
        }
        debug!("Memory listener closed");
    }

    /// Accept WebSocket connections on a TCP listener
    #[cfg(feature = "websocket")]
    #[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<(), RpcError> {
        use nmmes_rpc_transport::{websocket, TransportError};

        info!("Listening on {}", listener.local_addr().map_err(TransportError::from)?);
        loop {
            let (stream, addr) = listener.accept().await.map_err(TransportError::from)?;
            let server = self.clone();
            tokio::spawn(async move {
                let protocol = server.inner.config.protocol.clone();
                match websocket::accept(stream, &protocol).await {
                    Ok(handle) => {
                        if let Err(handle) = server.accept(handle) {
                            ignore(handle);
                        }
                    }
                    Err(e) => warn!("WebSocket handshake with {} failed: {}", addr, e),
                }
            });
        }
    }

    /// Close every live connection
    pub async fn close(&self) {
        for peer in self.connections() {
            if let Err(e) = peer.close().await {
                debug!("Closing {} failed: {}", peer.id(), e);
            }
        }
    }
}

/// Keep an unmanaged transport alive without dispatching its messages
fn ignore(mut handle: TransportHandle) {
    tokio::spawn(async move {
        while let Some(event) = handle.events.recv().await {
            if let TransportEvent::Close(_) = event {
                break;
            }
        }
    });
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("protocol", &self.inner.config.protocol)
            .field("connections", &self.connection_count())
            .field("handlers", &self.inner.handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests;
