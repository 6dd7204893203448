//! WebSocket transport over `tokio-tungstenite`

use async_trait::async_trait;
use bytes::Bytes;
use crate::{
    CloseFrame, Connector, Transport, TransportError, TransportEvent, TransportHandle,
    TransportInfo, TransportType, CLOSE_NO_STATUS,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// A WebSocket connection split into a locked sink and a reader task
pub struct WebSocketTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    closed: Arc<AtomicBool>,
    info: TransportInfo,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Take over an established stream and start pumping its events
    pub fn spawn(stream: WebSocketStream<S>, info: TransportInfo) -> TransportHandle {
        let (sink, source) = stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        // The handshake already completed
        let _ = events_tx.send(TransportEvent::Open);
        tokio::spawn(read_loop(source, events_tx, closed.clone()));

        let transport = Arc::new(Self {
            sink: Mutex::new(sink),
            closed,
            info,
        });
        TransportHandle::new(transport, events_rx)
    }
}

async fn read_loop<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let frame = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                let _ = events.send(TransportEvent::Message(Bytes::from(text)));
            }
            Some(Ok(Message::Binary(data))) => {
                let _ = events.send(TransportEvent::Message(Bytes::from(data)));
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => CloseFrame::new(u16::from(frame.code), frame.reason.into_owned()),
                    None => CloseFrame::new(CLOSE_NO_STATUS, ""),
                };
            }
            // Ping/pong are answered by tungstenite itself
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket read error: {}", e);
                break CloseFrame::abnormal(e.to_string());
            }
            None => break CloseFrame::abnormal("stream ended"),
        }
    };

    closed.store(true, Ordering::SeqCst);
    debug!("WebSocket closed: {}", frame);
    let _ = events.send(TransportEvent::Close(frame));
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        // Envelopes are JSON text; anything else goes out as binary
        let message = match String::from_utf8(payload.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.sink.lock().await.send(message).await?;
        Ok(())
    }

    async fn close(&self, frame: CloseFrame) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let message = Message::Close(Some(WsCloseFrame {
            code: CloseCode::from(frame.code),
            reason: Cow::Owned(frame.reason),
        }));
        match self.sink.lock().await.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => match TransportError::from(e) {
                TransportError::Closed => Ok(()),
                other => Err(other),
            },
        }
    }

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }
}

/// Dials a WebSocket URL requesting a sub-protocol
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    protocol: String,
}

impl WebSocketConnector {
    /// Create a connector requesting the default `nmmes-rpc` sub-protocol
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocol: nmmes_rpc_proto::PROTOCOL.to_string(),
        }
    }

    /// Request a different sub-protocol
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<TransportHandle, TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        let value = HeaderValue::from_str(&self.protocol)
            .map_err(|e| TransportError::Protocol(format!("Invalid sub-protocol: {}", e)))?;
        request.headers_mut().insert(PROTOCOL_HEADER, value);

        debug!("Dialing {}", self.url);
        let (stream, response) = tokio_tungstenite::connect_async(request).await?;

        let protocol = response
            .headers()
            .get(PROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        info!("Connected to {} (protocol: {:?})", self.url, protocol);

        let info = TransportInfo {
            peer: self.url.clone(),
            protocol,
            transport_type: TransportType::WebSocket,
        };
        Ok(WebSocketTransport::spawn(stream, info))
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

/// Perform the server handshake on an accepted TCP stream.
///
/// `protocol` is echoed back only when the client offered it; the handle's
/// [`TransportHandle::protocol`] tells the caller whether it was negotiated.
pub async fn accept(stream: TcpStream, protocol: &str) -> Result<TransportHandle, TransportError> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut negotiated = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let offered = request
            .headers()
            .get_all(PROTOCOL_HEADER)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|candidate| candidate.trim() == protocol);

        if offered {
            if let Ok(value) = HeaderValue::from_str(protocol) {
                response.headers_mut().insert(PROTOCOL_HEADER, value);
                negotiated = Some(protocol.to_string());
            }
        }
        Ok(response)
    };

    let stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    debug!("Accepted WebSocket from {} (protocol: {:?})", peer, negotiated);

    let info = TransportInfo {
        peer,
        protocol: negotiated,
        transport_type: TransportType::WebSocket,
    };
    Ok(WebSocketTransport::spawn(stream, info))
}
