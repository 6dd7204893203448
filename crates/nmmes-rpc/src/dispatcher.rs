//! Per-connection message routing
//!
//! The dispatcher decodes every inbound message of one connection and routes
//! it: responses settle entries of the correlation table, publishes go to the
//! local subscription callbacks, and calls run their handler on a separate
//! task whose outcome is sent back as a response. It also owns the outbound
//! side of calls so both directions share one correlation table.

use crate::{
    CorrelationTable, EndpointConfig, HandlerRegistry, LocalSubscriptions, RpcError,
    SubscriberSet, SubscriptionCallback,
};
use crate::subscription::ConnectionId;
use bytes::Bytes;
use nmmes_rpc_proto::{
    normalize, Args, Call, Envelope, EnvelopeCodec, ErrorCode, ErrorDetails, Publish, Response,
    SUBSCRIBE_NAMESPACE, UNSUBSCRIBE_NAMESPACE,
};
use nmmes_rpc_transport::{CloseFrame, Connection, ConnectionState, EventKind, TransportEvent};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Routes one connection's traffic
pub struct Dispatcher {
    connection_id: ConnectionId,
    connection: Connection,
    codec: EnvelopeCodec,
    table: CorrelationTable,
    handlers: HandlerRegistry,
    local: LocalSubscriptions,
    remote: SubscriberSet,
    config: EndpointConfig,
    has_opened: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher and install its listeners on the connection.
    ///
    /// The connection should not be started yet, or early messages are missed.
    pub fn attach(
        connection_id: ConnectionId,
        connection: Connection,
        handlers: HandlerRegistry,
        remote: SubscriberSet,
        config: EndpointConfig,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            connection_id,
            table: CorrelationTable::new(&config),
            codec: EnvelopeCodec::new(),
            local: LocalSubscriptions::new(),
            connection,
            handlers,
            remote,
            config,
            has_opened: AtomicBool::new(false),
        });

        // Listeners hold weak references; the connection must not keep us alive
        let weak = Arc::downgrade(&dispatcher);
        dispatcher.connection.add_listener(EventKind::Open, move |_| {
            if let Some(dispatcher) = Weak::upgrade(&weak) {
                dispatcher.connection_opened();
            }
        });
        let weak = Arc::downgrade(&dispatcher);
        dispatcher.connection.add_listener(EventKind::Message, move |event| {
            if let (Some(dispatcher), TransportEvent::Message(payload)) = (Weak::upgrade(&weak), event) {
                dispatcher.dispatch(payload);
            }
        });
        let weak = Arc::downgrade(&dispatcher);
        dispatcher.connection.add_listener(EventKind::Close, move |event| {
            if let (Some(dispatcher), TransportEvent::Close(frame)) = (Weak::upgrade(&weak), event) {
                dispatcher.connection_closed(frame);
            }
        });

        dispatcher
    }

    /// Id of the connection
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The connection this dispatcher serves
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Outstanding calls issued on this connection
    pub fn correlation(&self) -> &CorrelationTable {
        &self.table
    }

    /// Topic callbacks registered on this connection
    pub fn local_subscriptions(&self) -> &LocalSubscriptions {
        &self.local
    }

    /// Endpoint settings
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Route one inbound message. Malformed input is logged and dropped.
    pub fn dispatch(self: &Arc<Self>, payload: &[u8]) {
        let envelope = match self.codec.decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message on {}: {}", self.connection_id, e);
                return;
            }
        };

        trace!("Dispatching {:?} on {}", envelope.message_type(), self.connection_id);
        match envelope {
            Envelope::Call(call) => self.handle_call(call),
            Envelope::Response(response) => self.handle_response(response),
            Envelope::Publish(publish) => self.handle_publish(publish),
        }
    }

    fn handle_call(self: &Arc<Self>, call: Call) {
        let Call { id, namespace, data } = call;

        if namespace == SUBSCRIBE_NAMESPACE || namespace == UNSUBSCRIBE_NAMESPACE {
            let envelope = self.subscription_request(id, &namespace, &data);
            self.reply(envelope);
            return;
        }

        let Some(handler) = self.handlers.get(&namespace) else {
            debug!("Call {} to unregistered namespace {}", id, namespace);
            self.reply(Envelope::error(id, ErrorDetails::unregistered(&namespace)));
            return;
        };

        let dispatcher = self.clone();
        tokio::spawn(async move {
            debug!("Handling call {} to {}", id, namespace);
            // A separate task contains panics
            let outcome = tokio::spawn(async move { handler.call(data).await }).await;

            let envelope = match outcome {
                Ok(Ok(value)) => Envelope::result(id, normalize(value)),
                Ok(Err(e)) => {
                    debug!("Handler for {} failed: {}", namespace, e);
                    Envelope::error(id, e.into_details())
                }
                Err(e) if e.is_panic() => {
                    error!("Handler for {} panicked", namespace);
                    Envelope::error(id, ErrorDetails::new(ErrorCode::HandlerFailed, "handler panicked"))
                }
                Err(e) => {
                    warn!("Handler for {} did not complete: {}", namespace, e);
                    Envelope::error(id, ErrorDetails::new(ErrorCode::InternalError, "handler cancelled"))
                }
            };
            dispatcher.reply(envelope);
        });
    }

    /// Reserved subscribe/unsubscribe calls. Both always acknowledge with `[true]`.
    fn subscription_request(&self, id: u64, namespace: &str, data: &Args) -> Envelope {
        let Some(topic) = data.first().and_then(Value::as_str) else {
            return Envelope::error(
                id,
                ErrorDetails::new(ErrorCode::InvalidRequest, format!("{} expects a topic name", namespace)),
            );
        };

        if namespace == SUBSCRIBE_NAMESPACE {
            self.remote.add(topic, self.connection_id);
            debug!("{} subscribed to {}", self.connection_id, topic);
        } else {
            self.remote.remove(topic, self.connection_id);
            debug!("{} unsubscribed from {}", self.connection_id, topic);
        }
        Envelope::result(id, vec![Value::Bool(true)])
    }

    fn handle_response(&self, response: Response) {
        trace!("Response for call {}", response.id);
        self.table.settle(response.id, response.outcome);
    }

    fn handle_publish(&self, publish: Publish) {
        let Publish { namespace, data } = publish;
        if !self.local.deliver(&namespace, data) {
            debug!("No subscriber for publish on {}", namespace);
        }
    }

    fn connection_opened(self: &Arc<Self>) {
        if !self.has_opened.swap(true, Ordering::SeqCst) {
            return;
        }

        // The peer on the other side of a new transport has forgotten our topics
        for namespace in self.local.namespaces() {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                let timeout = dispatcher.config.call_timeout;
                let args = vec![Value::String(namespace.clone())];
                match dispatcher.call(SUBSCRIBE_NAMESPACE, args, timeout).await {
                    Ok(_) => debug!("Resubscribed to {}", namespace),
                    Err(e) => warn!("Failed to resubscribe to {}: {}", namespace, e),
                }
            });
        }
    }

    fn connection_closed(&self, frame: &CloseFrame) {
        if self.connection.state() == ConnectionState::Closed {
            let rejected = self.table.reject_all();
            if rejected > 0 {
                debug!("Rejected {} pending calls on closed {}", rejected, self.connection_id);
            }
        } else if !frame.is_normal() {
            // Still the generation of the transport that closed
            let rejected = self.table.reject_in_flight(self.connection.generation());
            if rejected > 0 {
                debug!("Rejected {} in-flight calls on {}", rejected, self.connection_id);
            }
        }

        // Whatever the remote subscribed to belonged to the transport that closed
        self.remote.remove_connection(self.connection_id);
    }

    /// Issue a call and wait for its response.
    ///
    /// The timeout covers time spent queued while the connection is down.
    pub async fn call(&self, namespace: &str, args: Args, timeout: Duration) -> Result<Args, RpcError> {
        let id = self.table.next_id();
        let payload = self.codec.encode(&Envelope::call(id, namespace, args))?;
        let mut pending = self.table.register(id, namespace, timeout);
        let sent = self.connection.send(payload);
        debug!("Calling {} (id {})", namespace, id);

        tokio::select! {
            biased;
            outcome = &mut pending => return outcome,
            sent = sent => {
                let generation = sent?;
                self.table.mark_sent(id, generation);
            }
        }

        pending.await
    }

    /// Store the callback, then ask the peer to add this connection to the topic.
    ///
    /// If the peer refuses, the callback that was registered before stays.
    pub async fn subscribe(&self, namespace: &str, callback: SubscriptionCallback) -> Result<(), RpcError> {
        let previous = self.local.insert(namespace, callback);

        let args = vec![Value::String(namespace.to_string())];
        if let Err(e) = self.call(SUBSCRIBE_NAMESPACE, args, self.config.call_timeout).await {
            match previous {
                Some(previous) => {
                    self.local.insert(namespace, previous);
                }
                None => {
                    self.local.remove(namespace);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Ask the peer to drop this connection from the topic, then remove the callback
    pub async fn unsubscribe(&self, namespace: &str) -> Result<(), RpcError> {
        let args = vec![Value::String(namespace.to_string())];
        let result = self.call(UNSUBSCRIBE_NAMESPACE, args, self.config.call_timeout).await;
        self.local.remove(namespace);
        result.map(|_| ())
    }

    /// Send a publish if the connection is open; returns whether it was sent
    pub fn publish(&self, namespace: &str, data: Args) -> Result<bool, RpcError> {
        if !self.connection.is_open() {
            trace!("Skipping publish on {} to non-open {}", namespace, self.connection_id);
            return Ok(false);
        }
        let payload = self.codec.encode(&Envelope::publish(namespace, data))?;
        self.transmit(payload);
        Ok(true)
    }

    fn reply(&self, envelope: Envelope) {
        let payload = match self.codec.encode(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode response on {}: {}", self.connection_id, e);
                let Some(id) = envelope.id() else {
                    return;
                };
                match self.codec.encode(&Envelope::error(id, e.into())) {
                    Ok(payload) => payload,
                    Err(_) => return,
                }
            }
        };
        self.transmit(payload);
    }

    fn transmit(&self, payload: Bytes) {
        let sent = self.connection.send(payload);
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            if let Err(e) = sent.await {
                debug!("Outbound message on {} dropped: {}", connection_id, e);
            }
        });
    }
}
