//! Transport abstraction
//!
//! A transport is one full-duplex, message-oriented link. It reports `Open`,
//! `Message` and `Close` events on a channel and accepts outbound payloads.
//! A connector produces fresh transports, which is all reconnection needs.

use async_trait::async_trait;
use bytes::Bytes;
use crate::TransportError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Closed without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code and reason reported when a transport closes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close code
    pub code: u16,
    /// Human-readable reason
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }

    /// Normal closure
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    /// Abnormal closure with a locally generated reason
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// Whether the code lies in the normal/going-away range, which suppresses reconnects
    pub fn is_normal(&self) -> bool {
        (CLOSE_NORMAL..=CLOSE_GOING_AWAY).contains(&self.code)
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Events a transport reports, in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport is ready to send
    Open,
    /// One inbound message
    Message(Bytes),
    /// The transport closed; no events follow
    Close(CloseFrame),
}

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// In-process channel pair
    Memory,
    /// WebSocket over TCP
    WebSocket,
}

/// Transport information
#[derive(Debug, Clone)]
pub struct TransportInfo {
    /// Remote address or description
    pub peer: String,
    /// Negotiated sub-protocol, if any
    pub protocol: Option<String>,
    /// Transport type
    pub transport_type: TransportType,
}

/// Sending half of a transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Close the transport with the given code
    async fn close(&self, frame: CloseFrame) -> Result<(), TransportError>;

    /// Get transport information
    fn info(&self) -> TransportInfo;
}

/// A transport together with its event stream
pub struct TransportHandle {
    /// Sending half
    pub transport: Arc<dyn Transport>,
    /// Event stream; starts with `Open` and ends with `Close`
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    /// Bundle a transport with its events
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self { transport, events }
    }

    /// Sub-protocol negotiated during the handshake
    pub fn protocol(&self) -> Option<String> {
        self.transport.info().protocol
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("info", &self.transport.info())
            .finish()
    }
}

/// Factory for transports; called once per (re)connect attempt
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport
    async fn connect(&self) -> Result<TransportHandle, TransportError>;

    /// Target description for logs
    fn target(&self) -> String;
}
