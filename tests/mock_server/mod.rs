//! Mock realtime server for integration tests
//!
//! Accepts WebSocket connections on an ephemeral local port and simulates the
//! realtime service closely enough to drive the transport and the session:
//! - greets every connection with `session.created`
//! - records handshake headers and every received client event
//! - answers client events through a pluggable responder
//! - can push frames, drop connections, refuse or reject new ones, and stall
//!   (stop reading, so liveness probes go unanswered)

// Not every test binary uses every helper
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

/// Upper bound for any wait in a test
pub const WAIT: Duration = Duration::from_secs(5);

type Responder = Box<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Handshake {
    pub uri: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
enum Outbound {
    Frame(String),
    Drop,
}

struct ServerState {
    received: Mutex<Vec<Value>>,
    handshakes: Mutex<Vec<Handshake>>,
    responder: Mutex<Option<Responder>>,
    connections: AtomicUsize,
    live: AtomicUsize,
    refuse: AtomicBool,
    reject_auth: AtomicBool,
    greet: AtomicBool,
    outbound: broadcast::Sender<Outbound>,
    stalled: watch::Sender<bool>,
}

pub struct MockRealtimeServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl MockRealtimeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (outbound, _) = broadcast::channel(256);
        let (stalled, _) = watch::channel(false);

        let state = Arc::new(ServerState {
            received: Mutex::new(Vec::new()),
            handshakes: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            connections: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            reject_auth: AtomicBool::new(false),
            greet: AtomicBool::new(true),
            outbound,
            stalled,
        });
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                let state = accept_state.clone();
                let shutdown = accept_shutdown.clone();
                tokio::spawn(handle_connection(stream, state, shutdown));
            }
        });

        Self {
            addr,
            state,
            shutdown,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }

    /// Reply to client events with the frames `responder` returns.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        *self.state.responder.lock() = Some(Box::new(responder));
    }

    pub fn set_greeting(&self, enabled: bool) {
        self.state.greet.store(enabled, Ordering::SeqCst);
    }

    /// Push a frame to every live connection.
    pub fn push(&self, event: Value) {
        self.push_raw(event.to_string());
    }

    pub fn push_raw(&self, frame: impl Into<String>) {
        let _ = self.state.outbound.send(Outbound::Frame(frame.into()));
    }

    /// Drop every live connection without a closing handshake.
    pub fn drop_connections(&self) {
        let _ = self.state.outbound.send(Outbound::Drop);
    }

    /// Close new TCP connections before the WebSocket handshake.
    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Answer new handshakes with 401.
    pub fn set_reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Stop (or resume) reading on every connection.
    pub fn stall(&self, stalled: bool) {
        self.state.stalled.send_replace(stalled);
    }

    /// Accepted WebSocket connections so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.state.handshakes.lock().clone()
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    pub fn received_of_type(&self, event_type: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|event| event["type"] == event_type)
            .collect()
    }

    /// Wait until at least `count` events of `event_type` arrived.
    pub async fn wait_for_type(&self, event_type: &str, count: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let matching = self.received_of_type(event_type);
            if matching.len() >= count {
                return matching;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "expected {count} '{event_type}' events, got {}: {:?}",
                    matching.len(),
                    self.received()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_connections(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.connection_count() < count {
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "expected {count} connections, got {}",
                    self.connection_count()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_no_live_connections(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.live_connections() > 0 {
            if tokio::time::Instant::now() > deadline {
                panic!("connections still open: {}", self.live_connections());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.accept_task.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>, shutdown: CancellationToken) {
    if state.refuse.load(Ordering::SeqCst) {
        drop(stream);
        return;
    }

    let handshake_state = state.clone();
    let callback = move |request: &Request, response: Response| {
        let headers = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        handshake_state.handshakes.lock().push(Handshake {
            uri: request.uri().to_string(),
            headers,
        });

        if handshake_state.reject_auth.load(Ordering::SeqCst) {
            let rejection: ErrorResponse = http::Response::builder()
                .status(http::StatusCode::UNAUTHORIZED)
                .body(Some("invalid api key".to_string()))
                .unwrap();
            return Err(rejection);
        }
        Ok(response)
    };

    let Ok(ws_stream) = accept_hdr_async(stream, callback).await else {
        return;
    };

    let connection_id = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    state.live.fetch_add(1, Ordering::SeqCst);
    let mut outbound = state.outbound.subscribe();
    let mut stalled = state.stalled.subscribe();
    let (mut write, mut read) = ws_stream.split();

    if state.greet.load(Ordering::SeqCst) {
        let greeting = json!({
            "type": "session.created",
            "event_id": format!("event_greet_{connection_id}"),
            "session": { "id": format!("sess_{connection_id}"), "model": "gpt-4o-realtime-preview" }
        });
        let _ = write.send(Message::Text(greeting.to_string().into())).await;
    }

    loop {
        if *stalled.borrow_and_update() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = stalled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                outgoing = outbound.recv() => match outgoing {
                    Ok(Outbound::Drop) | Err(broadcast::error::RecvError::Closed) => break,
                    _ => continue,
                },
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = stalled.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            outgoing = outbound.recv() => match outgoing {
                Ok(Outbound::Frame(frame)) => {
                    if write.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Outbound::Drop) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let event: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                    state.received.lock().push(event.clone());
                    let replies = state
                        .responder
                        .lock()
                        .as_ref()
                        .map(|responder| responder(&event))
                        .unwrap_or_default();
                    for reply in replies {
                        if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.live.fetch_sub(1, Ordering::SeqCst);
}

// =============================================================================
// Canned server events
// =============================================================================

pub fn response_created(response_id: &str) -> Value {
    json!({
        "type": "response.created",
        "event_id": "event_rc",
        "response": { "id": response_id, "status": "in_progress", "output": [] }
    })
}

pub fn response_done(response_id: &str) -> Value {
    json!({
        "type": "response.done",
        "event_id": "event_rd",
        "response": {
            "id": response_id,
            "status": "completed",
            "output": [],
            "usage": { "total_tokens": 42, "input_tokens": 30, "output_tokens": 12 }
        }
    })
}

pub fn item_created(item: &Value) -> Value {
    json!({
        "type": "conversation.item.created",
        "event_id": "event_ic",
        "previous_item_id": null,
        "item": item
    })
}
