//! Subscribe, publish and unsubscribe across connections

mod integration;

use anyhow::Result;
use integration::Fixture;
use nmmes_rpc::transport::memory;
use nmmes_rpc::{Args, Client, Server};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn inbox() -> (impl Fn(Args) + Send + Sync + 'static, mpsc::UnboundedReceiver<Args>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |data: Args| { let _ = tx.send(data); }, rx)
}

async fn nothing_arrives(rx: &mut mpsc::UnboundedReceiver<Args>) {
    let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(received.is_err(), "unexpected publish: {:?}", received);
}

/// Publishes fan out to every subscribed connection and no other
#[tokio::test]
async fn test_publish_fans_out_to_subscribers() -> Result<()> {
    let server = Server::default();
    let (connector, listener) = memory::endpoint(Some("nmmes-rpc"));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_memory(listener).await });

    let first = Client::builder(connector.clone()).connect().await?;
    let second = Client::builder(connector.clone()).connect().await?;
    let bystander = Client::builder(connector.clone()).connect().await?;

    let (callback, mut first_rx) = inbox();
    first.subscribe("news.alert", callback).await?;
    let (callback, mut second_rx) = inbox();
    second.subscribe("news.alert", callback).await?;
    let (callback, mut bystander_rx) = inbox();
    bystander.subscribe("sports", callback).await?;

    assert_eq!(server.connection_count(), 3);
    assert_eq!(server.publish("news.alert", vec![json!({"headline": "x"})])?, 2);

    assert_eq!(first_rx.recv().await, Some(vec![json!({"headline": "x"})]));
    assert_eq!(second_rx.recv().await, Some(vec![json!({"headline": "x"})]));
    nothing_arrives(&mut bystander_rx).await;
    Ok(())
}

/// After unsubscribing, publishes stop arriving
#[tokio::test]
async fn test_unsubscribe_stops_delivery() -> Result<()> {
    let fixture = Fixture::start(Server::default());
    let client = fixture.connect().await?;
    let (callback, mut rx) = inbox();

    client.subscribe("user.friend.login", callback).await?;
    assert_eq!(fixture.server.publish("user.friend.login", vec![json!("ada")])?, 1);
    assert_eq!(rx.recv().await, Some(vec![json!("ada")]));

    client.unsubscribe("user.friend.login").await?;
    assert!(fixture.server.subscribers("user.friend.login").is_empty());
    assert_eq!(fixture.server.publish("user.friend.login", vec![json!("bob")])?, 0);
    nothing_arrives(&mut rx).await;

    // Unsubscribing again is still acknowledged
    client.unsubscribe("user.friend.login").await?;
    Ok(())
}

/// Publishing to a topic nobody subscribed to is a no-op
#[tokio::test]
async fn test_publish_without_subscribers() -> Result<()> {
    let fixture = Fixture::start(Server::default());
    let _client = fixture.connect().await?;

    assert_eq!(fixture.server.publish("empty.topic", vec![json!(1)])?, 0);
    Ok(())
}

/// The server side may subscribe to topics the client publishes
#[tokio::test]
async fn test_client_publishes_to_server() -> Result<()> {
    let fixture = Fixture::start(Server::default());
    let client = fixture.connect().await?;
    assert_eq!(client.publish("client.status", vec![json!("idle")])?, 0);
    integration::eventually(|| fixture.server.connection_count() == 1).await;

    let peer = fixture.server.connections().remove(0);
    let (callback, mut rx) = inbox();
    peer.subscribe("client.status", callback).await?;

    assert_eq!(client.publish("client.status", vec![json!("busy")])?, 1);
    assert_eq!(rx.recv().await, Some(vec![json!("busy")]));
    Ok(())
}

/// A dropped connection leaves every topic it had joined
#[tokio::test]
async fn test_disconnected_subscriber_is_forgotten() -> Result<()> {
    let fixture = Fixture::start(Server::default());
    let client = fixture.client().with_reconnect(false).connect().await?;
    let (callback, _rx) = inbox();
    client.subscribe("news.alert", callback).await?;
    assert_eq!(fixture.server.subscribers("news.alert").len(), 1);

    fixture.drop_connections().await;

    integration::eventually(|| fixture.server.connection_count() == 0).await;
    assert!(fixture.server.subscribers("news.alert").is_empty());
    assert_eq!(fixture.server.publish("news.alert", vec![json!(1)])?, 0);
    Ok(())
}
