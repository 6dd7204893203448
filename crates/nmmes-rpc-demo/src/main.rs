//! nmmes-rpc demo
//!
//! Starts a server on a local WebSocket port, connects a client to it and
//! walks through calls in both directions, subscribe/publish/unsubscribe and
//! a broadcast ping of every connection.

use anyhow::Result;
use nmmes_rpc::{Args, ClientBuilder, HandlerError, Server};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

mod handlers;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Server::default();
    handlers::register(&server);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let serving = server.clone();
    tokio::spawn(async move {
        if let Err(e) = serving.serve(listener).await {
            error!("Server error: {}", e);
        }
    });

    let client = ClientBuilder::websocket(format!("ws://{}", addr))
        .with_call_timeout(Duration::from_secs(5))
        .with_handler("connection.ping", |_: Args| async {
            Ok::<_, HandlerError>(json!("pong"))
        })
        .connect()
        .await?;
    info!("Client connected to {}", addr);

    let sum: f64 = client.invoke("math.addition.2", &(1, 2)).await?;
    info!("math.addition.2(1, 2) = {}", sum);

    let upload = client
        .call("user.image.upload", vec![json!({"name": "cat.png", "size": 2048})])
        .await?;
    info!("user.image.upload -> {:?}", upload);

    if let Err(e) = client.call("user.image.delete", vec![json!("cat.png")]).await {
        info!("user.image.delete failed as expected: {}", e);
    }

    client
        .subscribe("user.friend.login", |data: Args| {
            info!("Friend logged in: {:?}", data);
        })
        .await?;
    let sent = server.publish("user.friend.login", vec![json!({"name": "ada"})])?;
    info!("Published login to {} connection(s)", sent);

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.unsubscribe("user.friend.login").await?;
    let sent = server.publish("user.friend.login", vec![json!({"name": "bob"})])?;
    info!("Published login to {} connection(s) after unsubscribe", sent);

    for peer in server.connections() {
        match peer.call("connection.ping", vec![]).await {
            Ok(reply) => info!("Connection {} answered {:?}", peer.id(), reply),
            Err(e) => error!("Connection {} did not answer: {}", peer.id(), e),
        }
    }

    client.close().await?;
    server.close().await;
    info!("Demo finished");
    Ok(())
}
