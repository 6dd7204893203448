//! Connection lifecycle management
//!
//! A [`Connection`] owns whatever transport is current and hides its churn
//! from the layers above:
//!
//! - outbound messages go through one FIFO queue and are held while the
//!   connection is `Connecting`, then flushed in order once it opens again
//! - listeners registered with [`Connection::add_listener`] see the events of
//!   every transport the connection goes through
//! - an abnormal close on a dialing connection schedules a reconnect with
//!   exponential backoff; a normal close or [`Connection::close`] is final
//!
//! Connections are created idle so listeners can be installed before the
//! first event is read; [`Connection::start`] spawns the driver and writer
//! tasks.

use crate::{
    BackoffConfig, BackoffStrategy, CloseFrame, Connector, ExponentialBackoff, Transport,
    TransportError, TransportEvent, TransportHandle, TransportInfo,
};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing, or waiting out a backoff delay; sends are queued
    Connecting,
    /// A transport is open; queued sends are flushed
    Open,
    /// Terminal; no further reconnects and sends fail
    Closed,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reconnect delay policy
    pub backoff: BackoffConfig,
    /// Reconnect after abnormal closes
    pub reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            reconnect: true,
        }
    }
}

impl ConnectionConfig {
    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable reconnection
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Which events a listener wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A transport opened
    Open,
    /// An inbound message arrived
    Message,
    /// A transport closed
    Close,
}

impl EventKind {
    /// Kind of a transport event
    pub fn of(event: &TransportEvent) -> Self {
        match event {
            TransportEvent::Open => Self::Open,
            TransportEvent::Message(_) => Self::Message,
            TransportEvent::Close(_) => Self::Close,
        }
    }
}

/// Event callback; runs on the connection's driver task and must not block
pub type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Handle returned by [`Connection::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Outbound {
    payload: Bytes,
    done: oneshot::Sender<Result<u64, TransportError>>,
}

enum Source {
    /// Client role: dial again after every abnormal close
    Dial(Arc<dyn Connector>),
    /// Server role: one already-established transport
    Accepted(Option<TransportHandle>),
}

struct Startup {
    source: Source,
    backoff: Box<dyn BackoffStrategy>,
    reconnect: bool,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

struct Inner {
    target: String,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Transports bound so far; written under the `transport` lock
    generation: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, EventKind, Listener)>>,
    next_listener: AtomicU64,
    closing: AtomicBool,
    shutdown: Notify,
    exhausted: Mutex<Option<u32>>,
    startup: Mutex<Option<Startup>>,
}

/// A message-oriented link that survives transport failures
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create an idle client connection that dials through `connector`
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let backoff = Box::new(ExponentialBackoff::new(config.backoff));
        Self::with_strategy(connector, backoff, config.reconnect)
    }

    /// Create an idle client connection with a custom backoff strategy
    pub fn with_strategy(
        connector: Arc<dyn Connector>,
        backoff: Box<dyn BackoffStrategy>,
        reconnect: bool,
    ) -> Self {
        let target = connector.target();
        Self::build(target, Source::Dial(connector), backoff, reconnect)
    }

    /// Create an idle connection around an accepted transport. It never reconnects.
    pub fn from_transport(handle: TransportHandle) -> Self {
        let target = handle.transport.info().peer;
        let backoff = Box::new(ExponentialBackoff::new(BackoffConfig::default()));
        Self::build(target, Source::Accepted(Some(handle)), backoff, false)
    }

    /// Create a client connection and start it
    pub fn connect(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let connection = Self::new(connector, config);
        connection.start();
        connection
    }

    fn build(
        target: String,
        source: Source,
        backoff: Box<dyn BackoffStrategy>,
        reconnect: bool,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let startup = Startup {
            source,
            backoff,
            reconnect,
            outbound: outbound_rx,
        };

        Self {
            inner: Arc::new(Inner {
                target,
                state,
                outbound: outbound_tx,
                transport: RwLock::new(None),
                generation: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                closing: AtomicBool::new(false),
                shutdown: Notify::new(),
                exhausted: Mutex::new(None),
                startup: Mutex::new(Some(startup)),
            }),
        }
    }

    /// Spawn the driver and writer tasks. Later calls do nothing.
    pub fn start(&self) {
        let startup = self
            .inner
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(startup) = startup else {
            return;
        };

        // Dropping the queue fails anything sent before close()
        if self.inner.closing.load(Ordering::SeqCst) {
            return;
        }

        let Startup { source, backoff, reconnect, outbound } = startup;
        tokio::spawn(self.inner.clone().drive(source, backoff, reconnect));
        tokio::spawn(self.inner.clone().write_loop(outbound));
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether a transport is currently open
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Target description (URL or peer address)
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Information about the current transport, if one is bound
    pub fn info(&self) -> Option<TransportInfo> {
        self.inner.current_transport().map(|(_, t)| t.info())
    }

    /// Wait until the connection is open, failing if it closes first
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut state = self.inner.state.subscribe();
        match wait_state(&mut state, |s| *s != ConnectionState::Connecting).await {
            ConnectionState::Open => Ok(()),
            _ => Err(self.inner.closed_error()),
        }
    }

    /// Wait until the connection reaches its terminal state
    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        wait_state(&mut state, |s| *s == ConnectionState::Closed).await;
    }

    /// Generation of the current or most recently closed transport.
    ///
    /// Starts at 0 and increases each time a transport is bound. While a
    /// `Close` event is emitted it identifies the transport that closed.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Queue `payload` for transmission.
    ///
    /// The message takes its place in the outbound queue when this is
    /// called, not when the returned future is first polled, so the order of
    /// `send` calls is the order on the wire. The future resolves with the
    /// [`generation`](Self::generation) of the transport that took the message.
    pub fn send(
        &self,
        payload: Bytes,
    ) -> impl Future<Output = Result<u64, TransportError>> + Send + 'static {
        let queued = self.inner.enqueue(payload);
        async move {
            let done = queued?;
            done.await.map_err(|_| TransportError::Closed)?
        }
    }

    /// Register an event listener
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, kind, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    /// Close with a normal code. No reconnect follows; queued sends fail.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing connection to {}", self.inner.target);

        self.inner.shutdown.notify_one();
        let transport = self.inner.take_transport();
        let result = match transport {
            Some(transport) => transport.close(CloseFrame::normal()).await,
            None => Ok(()),
        };

        self.inner.set_state(ConnectionState::Closed);
        // Not started yet: drop the queue so pending sends fail
        self.inner
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        result
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.inner.target)
            .field("state", &self.state())
            .finish()
    }
}

async fn wait_state<F>(state: &mut watch::Receiver<ConnectionState>, predicate: F) -> ConnectionState
where
    F: FnMut(&ConnectionState) -> bool,
{
    match state.wait_for(predicate).await {
        Ok(current) => *current,
        Err(_) => ConnectionState::Closed,
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        // Closed is terminal
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn closed_error(&self) -> TransportError {
        match *self.exhausted.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(attempts) => TransportError::RetriesExhausted { attempts },
            None => TransportError::Closed,
        }
    }

    fn enqueue(
        &self,
        payload: Bytes,
    ) -> Result<oneshot::Receiver<Result<u64, TransportError>>, TransportError> {
        if *self.state.borrow() == ConnectionState::Closed {
            return Err(self.closed_error());
        }
        let (done, rx) = oneshot::channel();
        self.outbound
            .send(Outbound { payload, done })
            .map_err(|_| self.closed_error())?;
        Ok(rx)
    }

    fn current_transport(&self) -> Option<(u64, Arc<dyn Transport>)> {
        let slot = self.transport.read().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.load(Ordering::SeqCst);
        slot.as_ref().map(|transport| (generation, transport.clone()))
    }

    fn bind_transport(&self, transport: Arc<dyn Transport>) {
        let mut slot = self.transport.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *slot = Some(transport);
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn emit(&self, event: &TransportEvent) {
        let kind = EventKind::of(event);
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, wanted, _)| *wanted == kind)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    async fn drive(
        self: Arc<Self>,
        mut source: Source,
        mut backoff: Box<dyn BackoffStrategy>,
        reconnect: bool,
    ) {
        loop {
            let attempt = match &mut source {
                Source::Accepted(handle) => match handle.take() {
                    Some(handle) => Ok(handle),
                    None => break,
                },
                Source::Dial(connector) => {
                    debug!("Connecting to {}", self.target);
                    tokio::select! {
                        result = connector.connect() => result,
                        _ = self.shutdown.notified() => break,
                    }
                }
            };

            let frame = match attempt {
                Ok(handle) => Some(self.run_transport(handle, backoff.as_mut()).await),
                Err(e) => {
                    warn!("Connection attempt to {} failed: {}", self.target, e);
                    None
                }
            };

            let retry = !self.closing.load(Ordering::SeqCst)
                && reconnect
                && matches!(source, Source::Dial(_))
                && frame.as_ref().map_or(true, |frame| !frame.is_normal());
            let delay = if retry { backoff.backoff() } else { None };

            if retry && delay.is_none() {
                let attempts = backoff.attempts();
                error!("Giving up on {} after {} reconnect attempts", self.target, attempts);
                *self.exhausted.lock().unwrap_or_else(PoisonError::into_inner) = Some(attempts);
            }

            match delay {
                Some(_) => self.set_state(ConnectionState::Connecting),
                None => self.set_state(ConnectionState::Closed),
            }
            if let Some(frame) = frame {
                self.emit(&TransportEvent::Close(frame));
            }

            let Some(delay) = delay else {
                break;
            };
            warn!("Reconnecting to {} in {:?}", self.target, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        self.set_state(ConnectionState::Closed);
        debug!("Connection driver for {} finished", self.target);
    }

    /// Pump one transport's events until it closes
    async fn run_transport(
        &self,
        handle: TransportHandle,
        backoff: &mut dyn BackoffStrategy,
    ) -> CloseFrame {
        let TransportHandle { transport, mut events } = handle;
        self.bind_transport(transport.clone());

        // close() may have run before the transport was bound
        if self.closing.load(Ordering::SeqCst) {
            self.take_transport();
            if let Err(e) = transport.close(CloseFrame::normal()).await {
                debug!("Error closing transport: {}", e);
            }
            return CloseFrame::normal();
        }

        let frame = loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.shutdown.notified() => break CloseFrame::normal(),
            };

            match event {
                Some(TransportEvent::Open) => {
                    backoff.reset();
                    info!("Connection to {} open", self.target);
                    self.set_state(ConnectionState::Open);
                    self.emit(&TransportEvent::Open);
                }
                Some(event @ TransportEvent::Message(_)) => self.emit(&event),
                Some(TransportEvent::Close(frame)) => break frame,
                None => break CloseFrame::abnormal("event stream ended"),
            }
        };

        self.take_transport();
        if frame.is_normal() {
            info!("Connection to {} closed: {}", self.target, frame);
        } else {
            warn!("Connection to {} lost: {}", self.target, frame);
        }
        frame
    }

    async fn write_loop(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut state = self.state.subscribe();
        let mut closed = self.state.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = wait_state(&mut closed, |s| *s == ConnectionState::Closed) => break,
                item = outbound.recv() => match item {
                    Some(item) => {
                        let result = self.deliver(item.payload, &mut state).await;
                        let _ = item.done.send(result);
                    }
                    None => break,
                },
            }
        }

        outbound.close();
        while let Ok(item) = outbound.try_recv() {
            let _ = item.done.send(Err(self.closed_error()));
        }
    }

    /// Hand one payload to the current transport, holding it across reconnects
    async fn deliver(
        &self,
        payload: Bytes,
        state: &mut watch::Receiver<ConnectionState>,
    ) -> Result<u64, TransportError> {
        loop {
            if wait_state(state, |s| *s != ConnectionState::Connecting).await == ConnectionState::Closed {
                return Err(self.closed_error());
            }

            let Some((generation, transport)) = self.current_transport() else {
                wait_state(state, |s| *s != ConnectionState::Open).await;
                continue;
            };

            match transport.send(payload.clone()).await {
                Ok(()) => return Ok(generation),
                Err(TransportError::Closed | TransportError::NotOpen) => {
                    debug!("Transport to {} went away mid-send, holding message", self.target);
                    wait_state(state, |s| *s != ConnectionState::Open).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
