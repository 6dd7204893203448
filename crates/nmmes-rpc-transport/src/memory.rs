//! In-process transport
//!
//! Channel-backed transports for endpoints living in the same process and for
//! tests. A [`MemoryConnector`] dials its [`MemoryListener`] the way a
//! WebSocket client dials a server, and can be told to refuse connections.

use async_trait::async_trait;
use bytes::Bytes;
use crate::{
    CloseFrame, Connector, Transport, TransportError, TransportEvent, TransportHandle,
    TransportInfo, TransportType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// One end of an in-memory transport pair
pub struct MemoryTransport {
    /// Events delivered to our own side (close notifications)
    local_events: mpsc::UnboundedSender<TransportEvent>,
    /// Events delivered to the other side
    remote_events: mpsc::UnboundedSender<TransportEvent>,
    /// Shared by both ends; once set neither side can send
    closed: Arc<AtomicBool>,
    /// Transport information
    info: TransportInfo,
}

/// Create a connected pair of transports. Both event streams start with `Open`.
pub fn pair(protocol: Option<&str>) -> (TransportHandle, TransportHandle) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let _ = a_tx.send(TransportEvent::Open);
    let _ = b_tx.send(TransportEvent::Open);

    let info = TransportInfo {
        peer: "memory".to_string(),
        protocol: protocol.map(str::to_string),
        transport_type: TransportType::Memory,
    };

    let a = MemoryTransport {
        local_events: a_tx.clone(),
        remote_events: b_tx.clone(),
        closed: closed.clone(),
        info: info.clone(),
    };
    let b = MemoryTransport {
        local_events: b_tx,
        remote_events: a_tx,
        closed,
        info,
    };

    (
        TransportHandle::new(Arc::new(a), a_rx),
        TransportHandle::new(Arc::new(b), b_rx),
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.remote_events.send(TransportEvent::Message(payload)).is_err() {
            // The other end was dropped without closing
            if !self.closed.swap(true, Ordering::SeqCst) {
                let _ = self
                    .local_events
                    .send(TransportEvent::Close(CloseFrame::abnormal("peer dropped")));
            }
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn close(&self, frame: CloseFrame) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing memory transport: {}", frame);
        let _ = self.remote_events.send(TransportEvent::Close(frame.clone()));
        let _ = self.local_events.send(TransportEvent::Close(frame));
        Ok(())
    }

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }
}

/// Create a connector and the listener it dials
pub fn endpoint(protocol: Option<&str>) -> (MemoryConnector, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let connector = MemoryConnector {
        accept_tx,
        protocol: protocol.map(str::to_string),
        refusing: Arc::new(AtomicBool::new(false)),
        attempts: Arc::new(Mutex::new(Vec::new())),
    };
    (connector, MemoryListener { accept_rx })
}

/// Dials a [`MemoryListener`]
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<TransportHandle>,
    protocol: Option<String>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl MemoryConnector {
    /// Make subsequent connect attempts fail
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Instants of every connect attempt so far
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<TransportHandle, TransportError> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Instant::now());

        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("connection refused".to_string()));
        }

        let (client, server) = pair(self.protocol.as_deref());
        self.accept_tx
            .send(server)
            .map_err(|_| TransportError::Connection("listener dropped".to_string()))?;
        Ok(client)
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

/// Accepting side of an in-memory endpoint
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<TransportHandle>,
}

impl MemoryListener {
    /// Wait for the next inbound transport
    pub async fn accept(&mut self) -> Option<TransportHandle> {
        self.accept_rx.recv().await
    }
}
