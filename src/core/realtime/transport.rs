//! WebSocket transport with liveness probing and automatic reconnection.
//!
//! A [`Transport`] owns at most one live connection. `connect` resolves only
//! after a ping carrying a random payload was answered by a matching pong.
//! Once connected, two tasks run until `disconnect`:
//!
//! - the connection task, which writes outbound frames, forwards inbound text
//!   frames and, when the socket drops, redials the last endpoint with
//!   exponential backoff;
//! - the heartbeat task, which probes the connection every
//!   `heartbeat_interval` and forces a reconnect when a probe goes unanswered.
//!
//! Inbound frames and reconnect lifecycle notifications are delivered in order
//! through [`Transport::receive`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::base::{
    ClientEventSink, ConnectionState, RealtimeError, RealtimeResult, ReconnectionConfig,
};
use super::config::{HEARTBEAT_INTERVAL, PROBE_TIMEOUT};
use super::messages::{self, ClientEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel capacity for outbound commands.
const WS_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on the closing handshake during disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub reconnection: ReconnectionConfig,
    /// Interval between liveness probes while connected
    pub heartbeat_interval: Duration,
    /// Time allowed for the handshake and for each liveness probe
    pub probe_timeout: Duration,
    /// Capacity of the outbound command channel
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnection: ReconnectionConfig::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
            channel_capacity: WS_CHANNEL_CAPACITY,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Items yielded by [`Transport::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An inbound text frame
    Frame(String),
    /// The connection dropped and attempt `attempt` starts after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Attempt `attempt` re-established the connection
    Reconnected { attempt: u32 },
    /// Reconnection was exhausted. Always the last event of a connection.
    Failed(RealtimeError),
}

// =============================================================================
// Internals
// =============================================================================

/// Persisted dial target. Headers carry credentials, so this is never logged.
#[derive(Clone)]
struct Endpoint {
    address: String,
    headers: Vec<(String, String)>,
}

impl Endpoint {
    fn new(address: &str, headers: &[(String, String)]) -> RealtimeResult<Self> {
        let url = url::Url::parse(address).map_err(|e| {
            RealtimeError::InvalidConfiguration(format!("invalid address '{address}': {e}"))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "address must use ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }
        for (name, value) in headers {
            parse_header(name, value)?;
        }
        Ok(Self {
            address: address.to_string(),
            headers: headers.to_vec(),
        })
    }

    fn request(&self) -> RealtimeResult<http::Request<()>> {
        let mut request = self
            .address
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(e.to_string()))?;
        for (name, value) in &self.headers {
            let (name, value) = parse_header(name, value)?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }
}

fn parse_header(name: &str, value: &str) -> RealtimeResult<(http::HeaderName, http::HeaderValue)> {
    let header_name = http::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
        RealtimeError::InvalidConfiguration(format!("invalid header name '{name}': {e}"))
    })?;
    let header_value = http::HeaderValue::from_str(value).map_err(|e| {
        RealtimeError::InvalidConfiguration(format!("invalid value for header '{name}': {e}"))
    })?;
    Ok((header_name, header_value))
}

struct Shared {
    state: RwLock<ConnectionState>,
    attempts: AtomicU32,
    /// Bumped on every successful dial so stale reconnect requests are ignored
    generation: AtomicU64,
    last_error: RwLock<Option<RealtimeError>>,
}

enum Command {
    Send {
        frame: String,
        ack: oneshot::Sender<RealtimeResult<()>>,
    },
    Probe {
        ack: oneshot::Sender<()>,
    },
    ForceReconnect {
        generation: u64,
        reason: String,
    },
}

enum Exit {
    Cancelled,
    Lost(String),
}

fn probe_nonce() -> Bytes {
    Bytes::copy_from_slice(Uuid::new_v4().as_bytes())
}

/// Open a socket and run the liveness probe. Text frames that arrive before
/// the pong are returned so they can be delivered first.
async fn dial(endpoint: &Endpoint, probe_timeout: Duration) -> RealtimeResult<(WsStream, Vec<String>)> {
    let request = endpoint.request()?;

    let (mut socket, _response) =
        tokio::time::timeout(probe_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| {
                RealtimeError::ConnectionFailed(format!(
                    "handshake timed out after {}ms",
                    probe_timeout.as_millis()
                ))
            })?
            .map_err(|e| match e {
                tungstenite::Error::Http(response)
                    if matches!(response.status().as_u16(), 401 | 403) =>
                {
                    RealtimeError::AuthenticationFailed(format!(
                        "server rejected credentials with status {}",
                        response.status()
                    ))
                }
                other => RealtimeError::ConnectionFailed(other.to_string()),
            })?;

    let early = probe(&mut socket, probe_timeout).await?;
    Ok((socket, early))
}

async fn probe(socket: &mut WsStream, probe_timeout: Duration) -> RealtimeResult<Vec<String>> {
    let nonce = probe_nonce();
    socket
        .send(Message::Ping(nonce.clone()))
        .await
        .map_err(|e| RealtimeError::ConnectionFailed(format!("failed to send probe: {e}")))?;

    let mut early = Vec::new();
    let wait = async {
        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Pong(payload)) if payload == nonce => return Ok(()),
                Ok(Message::Text(text)) => early.push(text.as_str().to_owned()),
                Ok(Message::Close(_)) => {
                    return Err(RealtimeError::ConnectionFailed(
                        "connection closed during liveness probe".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => return Err(RealtimeError::ConnectionFailed(e.to_string())),
            }
        }
        Err(RealtimeError::ConnectionFailed(
            "connection ended during liveness probe".to_string(),
        ))
    };
    let outcome = tokio::time::timeout(probe_timeout, wait).await;

    match outcome {
        Ok(Ok(())) => Ok(early),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RealtimeError::ConnectionFailed(format!(
            "liveness probe unanswered after {}ms",
            probe_timeout.as_millis()
        ))),
    }
}

// =============================================================================
// Connection Task
// =============================================================================

struct ConnectionTask {
    endpoint: Endpoint,
    config: TransportConfig,
    shared: Arc<Shared>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(mut self, mut socket: WsStream, early: Vec<String>) {
        self.forward(early);

        loop {
            match self.pump(&mut socket).await {
                Exit::Cancelled => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await;
                    break;
                }
                Exit::Lost(reason) => {
                    tracing::warn!("Realtime connection lost: {}", reason);
                    *self.shared.last_error.write() = Some(RealtimeError::ConnectionFailed(reason));
                    // Frames queued for the lost socket are never replayed.
                    while let Ok(command) = self.commands.try_recv() {
                        reject(command);
                    }
                    match self.reconnect().await {
                        Some(fresh) => socket = fresh,
                        None => break,
                    }
                }
            }
        }

        tracing::info!("Realtime connection task ended");
    }

    fn forward(&self, frames: Vec<String>) {
        for frame in frames {
            let _ = self.events.send(TransportEvent::Frame(frame));
        }
    }

    async fn pump(&mut self, socket: &mut WsStream) -> Exit {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let mut probes: VecDeque<(Bytes, oneshot::Sender<()>)> = VecDeque::new();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Exit::Cancelled,

                command = self.commands.recv() => match command {
                    None => return Exit::Cancelled,
                    Some(Command::Send { frame, ack }) => {
                        if let Err(e) = socket.send(Message::Text(frame.into())).await {
                            let _ = ack.send(Err(RealtimeError::ConnectionFailed(e.to_string())));
                            return Exit::Lost(format!("failed to send frame: {e}"));
                        }
                        let _ = ack.send(Ok(()));
                    }
                    Some(Command::Probe { ack }) => {
                        let nonce = probe_nonce();
                        if let Err(e) = socket.send(Message::Ping(nonce.clone())).await {
                            return Exit::Lost(format!("failed to send heartbeat: {e}"));
                        }
                        probes.push_back((nonce, ack));
                    }
                    Some(Command::ForceReconnect { generation: target, reason }) => {
                        if target == generation {
                            return Exit::Lost(reason);
                        }
                        tracing::debug!("Ignoring reconnect request for a previous connection");
                    }
                },

                message = socket.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if self.events.send(TransportEvent::Frame(text.as_str().to_owned())).is_err() {
                            return Exit::Cancelled;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        tracing::debug!("Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong; push it out now.
                        if let Err(e) = socket.flush().await {
                            return Exit::Lost(format!("failed to answer ping: {e}"));
                        }
                    }
                    Some(Ok(Message::Pong(payload))) => {
                        if let Some(pos) = probes.iter().position(|(nonce, _)| *nonce == payload)
                            && let Some((_, ack)) = probes.remove(pos)
                        {
                            let _ = ack.send(());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| {
                                format!("closed by server ({}): {}", u16::from(f.code), f.reason.as_str())
                            })
                            .unwrap_or_else(|| "closed by server".to_string());
                        return Exit::Lost(reason);
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("stream ended".to_string()),
                },
            }
        }
    }

    async fn reconnect(&mut self) -> Option<WsStream> {
        let policy = &self.config.reconnection;
        let mut attempt: u32 = 0;

        loop {
            if !policy.should_retry(attempt) {
                let last = self
                    .shared
                    .last_error
                    .read()
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                let error = RealtimeError::ConnectionFailed(format!(
                    "connection lost after {attempt} reconnection attempts: {last}"
                ));
                tracing::error!("{}", error);

                *self.shared.state.write() = ConnectionState::Error;
                *self.shared.last_error.write() = Some(error.clone());
                let _ = self.events.send(TransportEvent::Failed(error));
                self.cancel.cancel();
                return None;
            }

            attempt += 1;
            self.shared.attempts.store(attempt, Ordering::SeqCst);
            *self.shared.state.write() = ConnectionState::Reconnecting;

            let delay = policy.delay(attempt);
            tracing::info!(
                "Attempting reconnection {}/{} in {}ms",
                attempt,
                if policy.max_attempts == 0 {
                    "∞".to_string()
                } else {
                    policy.max_attempts.to_string()
                },
                delay.as_millis()
            );
            let _ = self
                .events
                .send(TransportEvent::Reconnecting { attempt, delay });

            reject_while(&mut self.commands, &self.cancel, tokio::time::sleep(delay)).await?;

            let outcome = reject_while(
                &mut self.commands,
                &self.cancel,
                dial(&self.endpoint, self.config.probe_timeout),
            )
            .await?;

            match outcome {
                Ok((socket, early)) => {
                    tracing::info!("Reconnected on attempt {}", attempt);
                    self.shared.generation.fetch_add(1, Ordering::SeqCst);
                    self.shared.attempts.store(0, Ordering::SeqCst);
                    *self.shared.state.write() = ConnectionState::Connected;
                    let _ = self.events.send(TransportEvent::Reconnected { attempt });
                    self.forward(early);
                    return Some(socket);
                }
                Err(e) => {
                    tracing::warn!("Reconnection attempt {} failed: {}", attempt, e);
                    *self.shared.last_error.write() = Some(e);
                }
            }
        }
    }
}

fn reject(command: Command) {
    if let Command::Send { ack, .. } = command {
        let _ = ack.send(Err(RealtimeError::NotConnected));
    }
}

/// Drive `operation` to completion while no socket is available, failing
/// every command that arrives meanwhile. `None` once cancelled.
async fn reject_while<F: Future>(
    commands: &mut mpsc::Receiver<Command>,
    cancel: &CancellationToken,
    operation: F,
) -> Option<F::Output> {
    let mut operation = std::pin::pin!(operation);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            output = &mut operation => return Some(output),
            Some(command) = commands.recv() => reject(command),
        }
    }
}

async fn run_heartbeat(
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    interval: Duration,
    probe_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if *shared.state.read() != ConnectionState::Connected {
            continue;
        }

        let generation = shared.generation.load(Ordering::SeqCst);
        let (ack, acked) = oneshot::channel();
        if commands.send(Command::Probe { ack }).await.is_err() {
            break;
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = tokio::time::timeout(probe_timeout, acked) => outcome,
        };

        match outcome {
            Ok(Ok(())) => tracing::trace!("Heartbeat acknowledged"),
            // The connection cycled while the probe was in flight.
            Ok(Err(_)) => tracing::debug!("Heartbeat probe dropped"),
            Err(_) => {
                tracing::warn!(
                    "Heartbeat unanswered after {}ms, forcing reconnection",
                    probe_timeout.as_millis()
                );
                let command = Command::ForceReconnect {
                    generation,
                    reason: "heartbeat probe timed out".to_string(),
                };
                if commands.send(command).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Heartbeat task ended");
}

// =============================================================================
// Transport
// =============================================================================

/// Owner of the live WebSocket connection.
///
/// # Thread Safety
///
/// All methods take `&self`; the transport is shared behind an `Arc` by the
/// session, the audio manager and tool invocations.
pub struct Transport {
    config: TransportConfig,
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    events: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                last_error: RwLock::new(None),
            }),
            commands: Mutex::new(None),
            events: Arc::new(tokio::sync::Mutex::new(None)),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnection attempts made since the connection was last healthy.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<RealtimeError> {
        self.shared.last_error.read().clone()
    }

    /// Open a connection to `address` with the given request headers.
    ///
    /// Any existing connection is torn down first. Resolves once the
    /// liveness probe succeeded.
    pub async fn connect(&self, address: &str, headers: &[(String, String)]) -> RealtimeResult<()> {
        let endpoint = Endpoint::new(address, headers)?;

        self.disconnect().await;
        *self.shared.state.write() = ConnectionState::Connecting;
        tracing::info!("Connecting to realtime endpoint {}", address);

        let (socket, early) = match dial(&endpoint, self.config.probe_timeout).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!("Failed to connect to realtime endpoint: {}", e);
                *self.shared.state.write() = ConnectionState::Error;
                *self.shared.last_error.write() = Some(e.clone());
                return Err(e);
            }
        };

        let (command_tx, command_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_error.write() = None;
        *self.shared.state.write() = ConnectionState::Connected;

        *self.events.lock().await = Some(event_rx);
        *self.commands.lock() = Some(command_tx.clone());
        *self.cancel.lock() = Some(cancel.clone());

        let task = ConnectionTask {
            endpoint,
            config: self.config.clone(),
            shared: self.shared.clone(),
            commands: command_rx,
            events: event_tx,
            cancel: cancel.clone(),
        };
        let connection = tokio::spawn(task.run(socket, early));
        let heartbeat = tokio::spawn(run_heartbeat(
            self.shared.clone(),
            command_tx,
            self.config.heartbeat_interval,
            self.config.probe_timeout,
            cancel,
        ));
        self.tasks.lock().extend([connection, heartbeat]);

        tracing::info!("Connected to realtime endpoint");
        Ok(())
    }

    /// Send one text frame. Resolves once the socket writer accepted it.
    pub async fn send(&self, frame: String) -> RealtimeResult<()> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        let commands = self
            .commands
            .lock()
            .clone()
            .ok_or(RealtimeError::NotConnected)?;

        let (ack, accepted) = oneshot::channel();
        commands
            .send(Command::Send { frame, ack })
            .await
            .map_err(|_| RealtimeError::NotConnected)?;
        accepted.await.map_err(|_| RealtimeError::NotConnected)?
    }

    /// Stream of inbound frames and reconnect notifications.
    ///
    /// Every returned stream reads the same underlying sequence, so calling
    /// this again resumes where the previous consumer stopped. The stream ends
    /// on `disconnect` or after [`TransportEvent::Failed`].
    pub fn receive(&self) -> impl Stream<Item = TransportEvent> + Send + 'static {
        let events = self.events.clone();
        futures::stream::unfold(events, |events| async move {
            let next = {
                let mut guard = events.lock().await;
                match guard.as_mut() {
                    Some(receiver) => receiver.recv().await,
                    None => None,
                }
            };
            next.map(|event| (event, events))
        })
    }

    /// Close the connection and stop both background tasks.
    pub async fn disconnect(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.commands.lock().take();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        *self.events.lock().await = None;
        self.shared.attempts.store(0, Ordering::SeqCst);

        let previous = std::mem::replace(&mut *self.shared.state.write(), ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            tracing::info!("Disconnected from realtime endpoint");
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.get_mut().take() {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl ClientEventSink for Transport {
    async fn send_event(&self, event: ClientEvent) -> RealtimeResult<()> {
        let frame = messages::encode(&event)?;
        tracing::debug!("Sending {}", event.event_type());
        self.send(frame).await
    }
}
