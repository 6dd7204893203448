//! # nmmes-rpc transport
//!
//! Transport contract, in-memory and WebSocket transports, and the
//! reconnecting [`Connection`] that the RPC layer runs on.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Transport abstraction
pub mod transport;

/// Connection lifecycle: reconnects, outbound queue and listeners
pub mod connection;

/// Reconnect delay policy
pub mod backoff;

/// In-process transports
pub mod memory;

/// WebSocket transport
#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
pub mod websocket;

/// Transport error types
pub mod error;

pub use transport::{
    CloseFrame, Connector, Transport, TransportEvent, TransportHandle, TransportInfo,
    TransportType, CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_NO_STATUS,
};
pub use connection::{Connection, ConnectionConfig, ConnectionState, EventKind, Listener, ListenerId};
pub use backoff::{BackoffConfig, BackoffStrategy, ExponentialBackoff};
pub use memory::{MemoryConnector, MemoryListener, MemoryTransport};
pub use error::TransportError;
