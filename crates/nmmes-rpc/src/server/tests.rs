//! Unit tests for the connection multiplexer

use super::*;
use bytes::Bytes;
use nmmes_rpc_transport::{memory, CloseFrame};
use serde_json::{json, Value};
use std::time::Duration;

/// Raw client end of an accepted transport
struct Wire {
    handle: TransportHandle,
}

impl Wire {
    async fn send(&self, value: Value) {
        self.handle
            .transport
            .send(Bytes::from(value.to_string()))
            .await
            .unwrap();
    }

    async fn next(&mut self) -> Value {
        loop {
            match self.handle.events.recv().await {
                Some(TransportEvent::Message(payload)) => {
                    return serde_json::from_slice(&payload).unwrap();
                }
                Some(TransportEvent::Open) => continue,
                other => panic!("Unexpected event: {:?}", other),
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) {
        self.send(json!({"type": "call", "id": 1, "namespace": "__subscribe__", "data": [topic]}))
            .await;
        assert_eq!(self.next().await["result"], json!([true]));
    }
}

fn connect(server: &Server) -> (Arc<Peer>, Wire) {
    let (near, far) = memory::pair(Some("nmmes-rpc"));
    let peer = server.accept(near).unwrap();
    (peer, Wire { handle: far })
}

async fn wait_for_count(server: &Server, expected: usize) {
    for _ in 0..100 {
        if server.connection_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} connections, have {}", expected, server.connection_count());
}

#[tokio::test]
async fn test_wrong_protocol_is_left_unmanaged() {
    let server = Server::default();

    let (near, _far) = memory::pair(None);
    assert!(server.accept(near).is_err());

    let (near, _far) = memory::pair(Some("chat"));
    let handle = server.accept(near).unwrap_err();
    assert_eq!(handle.protocol().as_deref(), Some("chat"));
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_custom_protocol() {
    let server = Server::new(ServerConfig::default().with_protocol("chat"));

    let (near, _far) = memory::pair(Some("chat"));
    assert!(server.accept(near).is_ok());
    let (near, _far) = memory::pair(Some("nmmes-rpc"));
    assert!(server.accept(near).is_err());
}

#[tokio::test]
async fn test_connections_snapshot() {
    let server = Server::default();
    let (a, _wa) = connect(&server);
    let (b, _wb) = connect(&server);

    assert_eq!(server.connection_count(), 2);
    let mut ids: Vec<ConnectionId> = server.connections().iter().map(|peer| peer.id()).collect();
    ids.sort();
    let mut expected = vec![a.id(), b.id()];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(server.connection(a.id()).is_some());
}

#[tokio::test]
async fn test_handlers_are_shared_by_connections() {
    let server = Server::default();
    server.register("math.add", |args: Args| async move {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok::<_, crate::HandlerError>(json!(sum))
    });
    let (_a, mut wa) = connect(&server);
    let (_b, mut wb) = connect(&server);

    wa.send(json!({"type": "call", "id": 1, "namespace": "math.add", "data": [1, 2]})).await;
    wb.send(json!({"type": "call", "id": 1, "namespace": "math.add", "data": [3, 4]})).await;

    assert_eq!(wa.next().await["result"], json!([3]));
    assert_eq!(wb.next().await["result"], json!([7]));
}

#[tokio::test]
async fn test_closed_connection_is_removed() {
    let server = Server::default();
    let (peer, mut wire) = connect(&server);
    let (_other, _other_wire) = connect(&server);
    wire.subscribe("news.alert").await;
    assert_eq!(server.subscribers("news.alert"), vec![peer.id()]);

    wire.handle.transport.close(CloseFrame::normal()).await.unwrap();

    wait_for_count(&server, 1).await;
    assert!(server.connection(peer.id()).is_none());
    assert!(server.subscribers("news.alert").is_empty());
}

#[tokio::test]
async fn test_publish_reaches_subscribers_only() {
    let server = Server::default();
    let (_a, mut wa) = connect(&server);
    let (_b, mut wb) = connect(&server);
    let (_c, mut wc) = connect(&server);
    wa.subscribe("news.alert").await;
    wb.subscribe("news.alert").await;
    wc.subscribe("weather").await;

    let sent = server.publish("news.alert", vec![json!({"headline": "x"})]).unwrap();
    assert_eq!(sent, 2);

    let expected = json!({"type": "publish", "namespace": "news.alert", "data": [{"headline": "x"}]});
    assert_eq!(wa.next().await, expected);
    assert_eq!(wb.next().await, expected);

    server.publish("weather", vec![json!("rain")]).unwrap();
    assert_eq!(wc.next().await["namespace"], json!("weather"));
}

#[tokio::test]
async fn test_publish_without_subscribers() {
    let server = Server::default();
    let (_a, _wa) = connect(&server);

    assert_eq!(server.publish("nobody.listens", vec![]).unwrap(), 0);
}

#[tokio::test]
async fn test_close_closes_every_connection() {
    let server = Server::default();
    let (a, _wa) = connect(&server);
    let (b, _wb) = connect(&server);
    a.connection().wait_open().await.unwrap();
    b.connection().wait_open().await.unwrap();

    server.close().await;

    wait_for_count(&server, 0).await;
    assert!(!a.is_open());
    assert!(!b.is_open());
}
