//! Handle for one managed connection

use crate::dispatcher::Dispatcher;
use crate::subscription::ConnectionId;
use crate::RpcError;
use nmmes_rpc_proto::{from_args, to_args, Args};
use nmmes_rpc_transport::{Connection, ConnectionState, TransportInfo};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The far end of one connection, as seen from this endpoint.
///
/// Calls, subscriptions and publishes issued through a peer travel on its
/// connection only. Each peer has its own correlation table.
pub struct Peer {
    dispatcher: Arc<Dispatcher>,
}

impl Peer {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.dispatcher.connection_id()
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        self.dispatcher.connection()
    }

    /// Connection state
    pub fn state(&self) -> ConnectionState {
        self.connection().state()
    }

    /// Whether the connection is open
    pub fn is_open(&self) -> bool {
        self.connection().is_open()
    }

    /// Current transport information
    pub fn info(&self) -> Option<TransportInfo> {
        self.connection().info()
    }

    /// Calls waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.dispatcher.correlation().len()
    }

    /// Call a namespace on the peer with the endpoint's default timeout
    pub async fn call(&self, namespace: &str, args: Args) -> Result<Args, RpcError> {
        let timeout = self.dispatcher.config().call_timeout;
        self.dispatcher.call(namespace, args, timeout).await
    }

    /// Call with an explicit timeout
    pub async fn call_with_timeout(
        &self,
        namespace: &str,
        args: Args,
        timeout: Duration,
    ) -> Result<Args, RpcError> {
        self.dispatcher.call(namespace, args, timeout).await
    }

    /// Call with typed arguments and result.
    ///
    /// `args` is normalized like any other payload, so a tuple is spread into
    /// positional arguments.
    pub async fn invoke<A, R>(&self, namespace: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let result = self.call(namespace, to_args(args)?).await?;
        Ok(from_args(result)?)
    }

    /// Receive the peer's publishes on `namespace`
    pub async fn subscribe<F>(&self, namespace: &str, callback: F) -> Result<(), RpcError>
    where
        F: Fn(Args) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(namespace, Arc::new(callback)).await
    }

    /// Stop receiving publishes on `namespace`
    pub async fn unsubscribe(&self, namespace: &str) -> Result<(), RpcError> {
        self.dispatcher.unsubscribe(namespace).await
    }

    /// Send a publish to this peer if its connection is open
    pub fn publish(&self, namespace: &str, data: Args) -> Result<bool, RpcError> {
        self.dispatcher.publish(namespace, data)
    }

    /// Close the connection; outstanding calls fail with `ConnectionLost`
    pub async fn close(&self) -> Result<(), RpcError> {
        let result = self.connection().close().await;
        self.dispatcher.correlation().reject_all();
        Ok(result?)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
