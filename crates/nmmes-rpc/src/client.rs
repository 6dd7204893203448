//! Solitary-connection endpoint
//!
//! A client dials one server and keeps the connection alive across drops.
//! It answers calls from the server with its own handlers and may publish
//! topics the server subscribed to.

use crate::dispatcher::Dispatcher;
use crate::subscription::ConnectionId;
use crate::{EndpointConfig, Handler, HandlerRegistry, Peer, RpcError, SubscriberSet};
use nmmes_rpc_proto::Args;
use nmmes_rpc_transport::{BackoffConfig, Connection, ConnectionConfig, ConnectionState, Connector};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Builder for configuring a client
pub struct ClientBuilder {
    /// Produces a transport per (re)connect
    connector: Arc<dyn Connector>,
    /// Reconnect behaviour
    connection: ConnectionConfig,
    /// Call settings
    endpoint: EndpointConfig,
    /// Handlers installed before the first message can arrive
    handlers: HandlerRegistry,
}

impl ClientBuilder {
    /// Create a builder around a connector
    pub fn new<C: Connector + 'static>(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            connection: ConnectionConfig::default(),
            endpoint: EndpointConfig::default(),
            handlers: HandlerRegistry::new(),
        }
    }

    /// Create a builder that dials a WebSocket URL with the `nmmes-rpc` sub-protocol
    #[cfg(feature = "websocket")]
    #[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
    pub fn websocket(url: impl Into<String>) -> Self {
        Self::new(nmmes_rpc_transport::websocket::WebSocketConnector::new(url))
    }

    /// Set the connection configuration
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Set the reconnect backoff
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.connection.backoff = backoff;
        self
    }

    /// Enable or disable reconnecting
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.connection.reconnect = reconnect;
        self
    }

    /// Set the endpoint configuration
    pub fn with_endpoint_config(mut self, config: EndpointConfig) -> Self {
        self.endpoint = config;
        self
    }

    /// Set the default call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint.call_timeout = timeout;
        self
    }

    /// Register a handler before connecting
    pub fn with_handler<H: Handler>(self, namespace: impl Into<String>, handler: H) -> Self {
        self.handlers.register(namespace, handler);
        self
    }

    /// Start connecting and return immediately. Calls made before the
    /// connection opens are queued.
    pub fn build(self) -> Client {
        let connection = Connection::new(self.connector, self.connection);
        let subscribers = SubscriberSet::new();
        let dispatcher = Dispatcher::attach(
            ConnectionId::new(),
            connection.clone(),
            self.handlers.clone(),
            subscribers.clone(),
            self.endpoint,
        );
        connection.start();
        info!("Client connecting to {}", connection.target());

        Client {
            peer: Arc::new(Peer::new(dispatcher)),
            handlers: self.handlers,
            subscribers,
        }
    }

    /// Connect and wait for the connection to open
    pub async fn connect(self) -> Result<Client, RpcError> {
        let client = self.build();
        client.wait_open().await?;
        Ok(client)
    }
}

/// Client endpoint
#[derive(Clone)]
pub struct Client {
    peer: Arc<Peer>,
    handlers: HandlerRegistry,
    subscribers: SubscriberSet,
}

impl Client {
    /// Start configuring a client
    pub fn builder<C: Connector + 'static>(connector: C) -> ClientBuilder {
        ClientBuilder::new(connector)
    }

    /// The server side of the connection
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        self.peer.connection()
    }

    /// Connection state
    pub fn state(&self) -> ConnectionState {
        self.peer.state()
    }

    /// Wait for the connection to open
    pub async fn wait_open(&self) -> Result<(), RpcError> {
        Ok(self.connection().wait_open().await?)
    }

    /// Answer calls to `namespace` from the server
    pub fn register<H: Handler>(&self, namespace: impl Into<String>, handler: H) {
        self.handlers.register(namespace, handler);
    }

    /// Remove a handler
    pub fn unregister(&self, namespace: &str) -> bool {
        self.handlers.unregister(namespace)
    }

    /// Call a namespace on the server
    pub async fn call(&self, namespace: &str, args: Args) -> Result<Args, RpcError> {
        self.peer.call(namespace, args).await
    }

    /// Call with an explicit timeout
    pub async fn call_with_timeout(
        &self,
        namespace: &str,
        args: Args,
        timeout: Duration,
    ) -> Result<Args, RpcError> {
        self.peer.call_with_timeout(namespace, args, timeout).await
    }

    /// Call with typed arguments and result
    pub async fn invoke<A, R>(&self, namespace: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.peer.invoke(namespace, args).await
    }

    /// Receive the server's publishes on `namespace`
    pub async fn subscribe<F>(&self, namespace: &str, callback: F) -> Result<(), RpcError>
    where
        F: Fn(Args) + Send + Sync + 'static,
    {
        self.peer.subscribe(namespace, callback).await
    }

    /// Stop receiving publishes on `namespace`
    pub async fn unsubscribe(&self, namespace: &str) -> Result<(), RpcError> {
        self.peer.unsubscribe(namespace).await
    }

    /// Publish to the server if it subscribed to `namespace`; returns the number of receivers
    pub fn publish(&self, namespace: &str, data: Args) -> Result<usize, RpcError> {
        if !self.subscribers.contains(namespace, self.peer.id()) {
            return Ok(0);
        }
        Ok(usize::from(self.peer.publish(namespace, data)?))
    }

    /// Close the connection. It is not reopened.
    pub async fn close(&self) -> Result<(), RpcError> {
        info!("Closing client connection to {}", self.connection().target());
        self.peer.close().await
    }
}
