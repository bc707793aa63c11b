//! CLI for the skein broker.
//!
//! Subcommands:
//! - `server`: run the WebSocket broker
//! - `client`: run a small smoke-test client (register, subscribe, publish)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skein_broker::TopicManager;
use skein_config::load_config;
use skein_session::SessionRegistry;
use skein_storage::open_storage;
use skein_transport::{start_websocket_server, WebSocketServer};

/// How long draining sessions get after a shutdown signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "skein")]
enum Command {
    /// Start the WebSocket broker
    Server,
    /// Run the smoke-test client (register a topic, subscribe, publish)
    Client {
        /// WebSocket URL of a running broker
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,
        /// Shared secret, when the broker has one configured
        #[arg(long, default_value = "")]
        api_key: String,
    },
}

#[tokio::main]
async fn main() {
    skein_utils::logging::init("info");

    match Command::parse() {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("server failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { url, api_key } => {
            if let Err(e) = run_client(&url, &api_key).await {
                error!("client failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config()?;
    let shutdown = CancellationToken::new();

    let store = open_storage(settings.storage, &settings.storage_path, shutdown.clone()).await?;
    let registry = Arc::new(SessionRegistry::new());
    let (manager, failed_peers) = TopicManager::new(store.clone());
    let server = WebSocketServer::new(registry, manager, settings.clone(), shutdown.clone());

    server.clone().listen_for_failed_peers(failed_peers);
    server.clone().start_cleanup_sweep();

    let addr = format!("0.0.0.0:{}", settings.port);
    let serving = tokio::spawn(start_websocket_server(addr, server));

    shutdown_signal().await;
    info!("shutdown signal received; draining");
    shutdown.cancel();

    if timeout(SHUTDOWN_DEADLINE, serving).await.is_err() {
        warn!("server did not drain within the shutdown deadline");
    }
    store.close().await;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("could not install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_client(url: &str, api_key: &str) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("ClientId", "skein-smoke-client".parse()?);
    if !api_key.is_empty() {
        request
            .headers_mut()
            .insert("Authorization", api_key.parse()?);
    }

    let (mut ws_stream, _response) = connect_async(request).await?;

    // 1. Register a topic with a one-field schema.
    let register = json!({
        "id": "r1",
        "action": "registerTopic",
        "topic": "smoke",
        "data": {"m": ""},
        "requireAck": true
    });
    ws_stream
        .send(WsMessage::text(register.to_string()))
        .await?;
    if let Some(Ok(WsMessage::Text(msg))) = ws_stream.next().await {
        println!("register response: {msg}");
    }

    // 2. Subscribe to it.
    let subscribe = json!({
        "id": "s1",
        "action": "subscribe",
        "topic": "smoke",
        "requireAck": true
    });
    ws_stream
        .send(WsMessage::text(subscribe.to_string()))
        .await?;
    if let Some(Ok(WsMessage::Text(msg))) = ws_stream.next().await {
        println!("subscribe response: {msg}");
    }

    // 3. Publish a conforming value; with self-delivery on, the delivery
    // frame and the ack both come back.
    let publish = json!({
        "id": "p1",
        "action": "publish",
        "topic": "smoke",
        "data": {"m": "hello from the smoke client"},
        "requireAck": true
    });
    ws_stream.send(WsMessage::text(publish.to_string())).await?;
    for _ in 0..2 {
        if let Some(Ok(WsMessage::Text(msg))) = ws_stream.next().await {
            println!("incoming: {msg}");
        }
    }

    // 4. Read the value back.
    let get = json!({
        "id": "g1",
        "action": "get",
        "topic": "smoke",
        "requireAck": true
    });
    ws_stream.send(WsMessage::text(get.to_string())).await?;
    if let Some(Ok(WsMessage::Text(msg))) = ws_stream.next().await {
        println!("get response: {msg}");
    }

    ws_stream.close(None).await?;
    Ok(())
}
