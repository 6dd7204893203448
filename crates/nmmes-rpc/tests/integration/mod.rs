//! Shared fixtures for end-to-end tests over the in-memory transport

#![allow(dead_code)]

use bytes::Bytes;
use nmmes_rpc::proto::PROTOCOL;
use nmmes_rpc::transport::{
    memory, BackoffConfig, CloseFrame, MemoryConnector, Transport, TransportEvent, TransportHandle,
};
use nmmes_rpc::{Args, Client, ClientBuilder, HandlerError, Server};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A server reachable through an in-memory connector.
///
/// Every accepted transport is remembered so tests can cut it abnormally.
pub struct Fixture {
    pub server: Server,
    pub connector: MemoryConnector,
    transports: Arc<Mutex<Vec<Arc<dyn Transport>>>>,
}

/// Route library logs to the test output; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Fixture {
    pub fn start(server: Server) -> Self {
        init_tracing();
        let (connector, mut listener) = memory::endpoint(Some(PROTOCOL));
        let transports: Arc<Mutex<Vec<Arc<dyn Transport>>>> = Arc::default();

        let accepted = transports.clone();
        let acceptor = server.clone();
        tokio::spawn(async move {
            while let Some(handle) = listener.accept().await {
                accepted.lock().unwrap().push(handle.transport.clone());
                acceptor.accept(handle).unwrap();
            }
        });

        Self {
            server,
            connector,
            transports,
        }
    }

    /// Client builder dialing this fixture with short reconnect delays
    pub fn client(&self) -> ClientBuilder {
        Client::builder(self.connector.clone()).with_backoff(fast_backoff())
    }

    pub async fn connect(&self) -> anyhow::Result<Client> {
        Ok(self.client().connect().await?)
    }

    /// Number of transports accepted so far
    pub fn accepted(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    /// Cut every live transport as if the network failed
    pub async fn drop_connections(&self) {
        let transports: Vec<_> = self.transports.lock().unwrap().clone();
        for transport in transports {
            transport.close(CloseFrame::abnormal("network down")).await.unwrap();
        }
    }
}

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig::default()
        .with_initial_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
}

/// Server answering `math.add` and `user.fail`
pub fn math_server() -> Server {
    let server = Server::default();
    server.register("math.add", |args: Args| async move {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok::<_, HandlerError>(json!(sum))
    });
    server.register("user.fail", |_: Args| async {
        Err::<Value, _>(HandlerError::new("user not found"))
    });
    server
}

/// Poll `condition` until it holds
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Next decoded message on a raw transport
pub async fn next_envelope(handle: &mut TransportHandle) -> Value {
    loop {
        match handle.events.recv().await {
            Some(TransportEvent::Message(payload)) => {
                return serde_json::from_slice(&payload).unwrap();
            }
            Some(TransportEvent::Open) => continue,
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}

/// Send a raw envelope
pub async fn send_envelope(handle: &TransportHandle, value: Value) {
    handle
        .transport
        .send(Bytes::from(value.to_string()))
        .await
        .unwrap();
}
