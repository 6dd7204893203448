//! # nmmes-rpc
//!
//! Bidirectional RPC and publish/subscribe over a message transport.
//!
//! Either endpoint registers handlers, calls namespaces on its peer and
//! subscribes to the peer's topics. A [`Client`] keeps one connection alive
//! across drops; a [`Server`] accepts many connections and fans publishes
//! out to the subscribed ones.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use nmmes_rpc_proto as proto;
pub use nmmes_rpc_transport as transport;

/// Error types
pub mod error;

/// Endpoint configuration
pub mod config;

/// Outstanding calls and their timeouts
pub mod correlation;

/// Handler registry
pub mod registry;

/// Subscription bookkeeping
pub mod subscription;

/// Per-connection message routing
pub mod dispatcher;

/// Handle for one managed connection
pub mod peer;

/// Client endpoint
pub mod client;

/// Server endpoint
pub mod server;

pub use error::RpcError;
pub use config::{EndpointConfig, ServerConfig, DEFAULT_CALL_TIMEOUT};
pub use correlation::{CorrelationTable, PendingCall};
pub use registry::{blocking, typed, Handler, HandlerError, HandlerRegistry, HandlerResult};
pub use subscription::{ConnectionId, LocalSubscriptions, SubscriberSet, SubscriptionCallback};
pub use dispatcher::Dispatcher;
pub use peer::Peer;
pub use client::{Client, ClientBuilder};
pub use server::Server;
pub use nmmes_rpc_proto::Args;

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
