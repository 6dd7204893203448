//! Transport error types

use thiserror::Error;
use std::io;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishing the underlying connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The transport or connection is closed
    #[error("Connection closed")]
    Closed,

    /// The transport is not open for sending
    #[error("Connection not open")]
    NotOpen,

    /// Handshake or sub-protocol negotiation failed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection abandoned after {attempts} attempts")]
    RetriesExhausted {
        /// Reconnect attempts made before giving up
        attempts: u32
    },
}

#[cfg(feature = "websocket")]
impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Io(e) => Self::Io(e),
            WsError::Protocol(e) => Self::Protocol(e.to_string()),
            other => Self::Connection(other.to_string()),
        }
    }
}
