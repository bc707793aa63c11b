//! The WebSocket server: upgrade gate, per-session read loop, and the
//! failed-peer cleanup loop.
//!
//! Each accepted connection gets two tasks: a writer that owns the sink
//! and drains the session's ordered outbound channel, and the read loop
//! that owns the receiving half. Cross-task signalling happens through the
//! session registry, the topic manager, and the failure counters.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use tungstenite::Error as WsError;
use uuid::Uuid;

use skein_broker::message::{Request, Response};
use skein_broker::TopicManager;
use skein_config::Settings;
use skein_session::{SendError, Session, SessionRegistry};

use crate::handlers::{handler_table, Handler};

/// Send failures a session may accumulate before the cleanup loop evicts
/// it.
pub const FAILED_MESSAGE_THRESHOLD: u32 = 3;

/// How often the cleanup loop sweeps the failure counters.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

const WS_PATH: &str = "/ws";

#[derive(Debug)]
struct FailedPeer {
    session: Arc<Session>,
    failures: u32,
}

pub struct WebSocketServer {
    registry: Arc<SessionRegistry>,
    manager: Arc<TopicManager>,
    settings: Settings,
    handlers: HashMap<&'static str, Handler>,
    failed_peers: Mutex<HashMap<String, FailedPeer>>,
    shutdown: CancellationToken,
}

impl WebSocketServer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        manager: Arc<TopicManager>,
        settings: Settings,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            manager,
            settings,
            handlers: handler_table(),
            failed_peers: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn manager(&self) -> &Arc<TopicManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections until the shutdown token fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }
        info!("accept loop stopped");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut client_id = String::new();

        let ws_stream = {
            let registry = self.registry.clone();
            let api_key = self.settings.api_key.clone();
            let chosen_id = &mut client_id;

            let callback = move |request: &UpgradeRequest,
                                 response: UpgradeResponse|
                  -> Result<UpgradeResponse, ErrorResponse> {
                if request.uri().path() != WS_PATH {
                    return Err(reject(StatusCode::NOT_FOUND, "not found"));
                }

                if !api_key.is_empty() {
                    let presented = header_value(request, "Authorization");
                    if presented != api_key {
                        return Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"));
                    }
                }

                let requested = header_value(request, "ClientId");
                let id = if requested.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    requested.to_string()
                };
                if registry.get(&id).is_some() {
                    return Err(reject(StatusCode::CONFLICT, "client ID already exists"));
                }

                *chosen_id = id;
                Ok(response)
            };

            match accept_hdr_async(stream, callback).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!(%addr, error = %e, "websocket handshake rejected");
                    return;
                }
            }
        };

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
        let session = Arc::new(Session::new(client_id, tx));

        self.registry.add(session.clone());
        info!(client = %session.id(), %addr, "client connected");

        spawn_session_writer(session.id().to_string(), ws_sender, rx);
        self.read_loop(&session, ws_receiver).await;

        self.registry.remove(session.id());
        session.close();
        info!(client = %session.id(), "client disconnected");
    }

    /// Decode one request per frame and dispatch it. Socket-closed
    /// conditions are destructive (the session leaves every topic and the
    /// loop exits); malformed frames answer 400 and the loop continues.
    async fn read_loop(
        self: &Arc<Self>,
        session: &Arc<Session>,
        mut ws_receiver: SplitStream<WebSocketStream<TcpStream>>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = ws_receiver.next() => match frame {
                    None => {
                        self.manager.unsubscribe_all(session);
                        break;
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Request>(text.as_str()) {
                            Ok(request) => self.route(session, request).await,
                            Err(e) => {
                                error!(client = %session.id(), error = %e, "could not decode request frame");
                                self.send_to_session(session, &Response::decode_failure());
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        match &frame {
                            Some(frame) => debug!(client = %session.id(), code = %frame.code, "close frame"),
                            None => debug!(client = %session.id(), "close frame"),
                        }
                        self.manager.unsubscribe_all(session);
                        break;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!(client = %session.id(), "ignoring binary frame");
                    }
                    Some(Ok(_)) => {} // ping/pong
                    Some(Err(e)) => {
                        if is_fatal(&e) {
                            error!(client = %session.id(), error = %e, "websocket closed");
                            self.manager.unsubscribe_all(session);
                            break;
                        }
                        error!(client = %session.id(), error = %e, "websocket read error");
                    }
                },
            }
        }
    }

    pub(crate) async fn route(self: &Arc<Self>, session: &Arc<Session>, request: Request) {
        debug!(client = %session.id(), action = %request.action, "routing request");

        match self.handlers.get(request.action.as_str()).cloned() {
            Some(handler) => handler(self.clone(), session.clone(), request).await,
            None => {
                warn!(action = %request.action, "unknown action");
                let message = format!("unknown action: {}", request.action);
                self.ack_bad_request(session, &request, &message);
            }
        }
    }

    // --- outbound frames and ack shaping ---

    /// Send one frame, counting a failure against the session when its
    /// socket has gone away.
    pub(crate) fn send_to_session(&self, session: &Arc<Session>, response: &Response) {
        match session.send_json(response) {
            Ok(()) => {}
            Err(SendError::Closed(_)) => self.mark_peer_failed(session.clone()),
            Err(e) => error!(client = %session.id(), error = %e, "could not send response"),
        }
    }

    /// Success without payload, sent only when the request asked for an
    /// ack.
    pub(crate) fn ack_success(&self, session: &Arc<Session>, request: &Request) {
        debug!(client = %session.id(), action = %request.action, id = %request.id, "handled");
        if request.require_ack {
            self.send_to_session(session, &Response::ok(request));
        }
    }

    /// Success with payload; always sent, the payload is the response.
    pub(crate) fn ack_success_with_data<T: Serialize>(
        &self,
        session: &Arc<Session>,
        request: &Request,
        data: &T,
    ) {
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                error!(action = %request.action, error = %e, "could not encode response payload");
                serde_json::Value::Null
            }
        };
        self.send_to_session(session, &Response::ok_with_data(request, data));
    }

    pub(crate) fn ack_bad_request(&self, session: &Arc<Session>, request: &Request, message: &str) {
        warn!(client = %session.id(), action = %request.action, id = %request.id, reason = message, "bad request");
        self.send_to_session(session, &Response::error(request, 400, message));
    }

    pub(crate) fn ack_error(&self, session: &Arc<Session>, request: &Request, message: &str) {
        error!(client = %session.id(), action = %request.action, id = %request.id, reason = message, "handler error");
        self.send_to_session(session, &Response::error(request, 500, message));
    }

    /// Persistence failures go out in their own frame, distinguished by
    /// `type: "persist"`, independent of the handler ack.
    pub(crate) fn ack_persist_error(
        &self,
        session: &Arc<Session>,
        request: &Request,
        message: &str,
    ) {
        error!(client = %session.id(), action = %request.action, id = %request.id, reason = message, "persistence error");
        self.send_to_session(session, &Response::persist_error(request, message));
    }

    // --- failed peers ---

    /// Count one failure against a session. Counters only reset through
    /// eviction.
    pub fn mark_peer_failed(&self, session: Arc<Session>) {
        let mut failed = self.failed_peers.lock().unwrap();
        let entry = failed
            .entry(session.id().to_string())
            .or_insert(FailedPeer {
                session,
                failures: 0,
            });
        entry.failures += 1;
    }

    /// Drain the topic manager's failed-peer channel into the counters.
    pub fn listen_for_failed_peers(
        self: Arc<Self>,
        mut failed_rx: mpsc::Receiver<Arc<Session>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(session) = failed_rx.recv().await {
                self.mark_peer_failed(session);
            }
        })
    }

    /// Periodically evict sessions whose failure count passed the
    /// threshold.
    pub fn start_cleanup_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = ticker.tick() => self.sweep_failed_peers(),
                }
            }
        })
    }

    pub(crate) fn sweep_failed_peers(&self) {
        // Collect under the counter lock, evict after releasing it; the
        // counter lock nests inside nothing.
        let evicted: Vec<Arc<Session>> = {
            let mut failed = self.failed_peers.lock().unwrap();
            let over: Vec<String> = failed
                .iter()
                .filter(|(_, peer)| peer.failures > FAILED_MESSAGE_THRESHOLD)
                .map(|(id, _)| id.clone())
                .collect();
            over.into_iter()
                .filter_map(|id| failed.remove(&id))
                .map(|peer| peer.session)
                .collect()
        };

        for session in evicted {
            warn!(client = %session.id(), "evicting failed peer");
            self.manager.unsubscribe_all(&session);
            self.registry.remove(session.id());
            session.close();
        }
    }
}

/// The writer task: sole owner of the sink. Frames leave in channel order;
/// a write failure or a queued Close frame ends the task.
fn spawn_session_writer(
    client: String,
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, WsMessage::Close(_));
            if let Err(e) = ws_sender.send(frame).await {
                debug!(client = %client, error = %e, "write failed; stopping writer");
                break;
            }
            if closing {
                break;
            }
        }
        debug!(client = %client, "send loop closed");
    })
}

fn header_value<'r>(request: &'r UpgradeRequest, name: &str) -> &'r str {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .trim()
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Whether a read error means the connection is gone.
fn is_fatal(error: &WsError) -> bool {
    matches!(
        error,
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) | WsError::Protocol(_)
    )
}

/// Bind `addr` and serve until shutdown.
pub async fn start_websocket_server(
    addr: String,
    server: Arc<WebSocketServer>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{addr}{WS_PATH}");
    server.serve(listener).await;
    Ok(())
}
