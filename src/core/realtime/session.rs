//! Session controller.
//!
//! [`RealtimeSession`] owns the transport, the local conversation, the audio
//! buffer and the tool bridge. Commands from the application and events from
//! the server both go through one async mutex, so state transitions are
//! applied in the order they happen.
//!
//! # State machine
//!
//! ```text
//! idle -> connecting -> ready
//! ready -> listening -> processing -> speaking -> ready
//! processing | speaking -> ready            (interrupt, response done)
//! any active state -> reconnecting -> ready (configuration re-pushed)
//! any state -> error                        (connect failure, retries exhausted)
//! any state -> disconnecting -> idle        (end)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::audio::{AudioBufferManager, AudioFlush};
use super::base::{
    ClientEventSink, ConnectionState, ConversationState, FunctionCallRequest, RealtimeAudioData,
    RealtimeConfig, RealtimeError, RealtimeResult, SessionConfiguration, StateChange,
    ToolDefinition, TranscriptResult, TranscriptRole,
};
use super::conversation::Conversation;
use super::feed::{DEFAULT_FEED_CAPACITY, Feed, FeedSubscription};
use super::messages::{
    self, ClientEvent, ConversationItem, ItemKind, RateLimit, ServerEvent, SessionConfig,
};
use super::tools::ToolBridge;
use super::transport::{Transport, TransportEvent};

// =============================================================================
// Feeds
// =============================================================================

struct SessionFeeds {
    transcript: Feed<TranscriptResult>,
    input_level: Feed<f32>,
    state: Feed<StateChange>,
    output_audio: Feed<RealtimeAudioData>,
}

impl SessionFeeds {
    fn new() -> Self {
        Self {
            transcript: Feed::new("transcript", DEFAULT_FEED_CAPACITY),
            input_level: Feed::new("input_level", DEFAULT_FEED_CAPACITY),
            state: Feed::new("state", DEFAULT_FEED_CAPACITY),
            output_audio: Feed::new("output_audio", DEFAULT_FEED_CAPACITY),
        }
    }

    fn reopen(&self) {
        self.transcript.reopen();
        self.input_level.reopen();
        self.state.reopen();
        self.output_audio.reopen();
    }

    fn finish(&self) {
        self.transcript.finish();
        self.input_level.finish();
        self.state.finish();
        self.output_audio.finish();
    }

    fn publish_levels(&self, flush: &AudioFlush) {
        for level in &flush.levels {
            self.input_level.publish(*level);
        }
    }

    fn publish_transcript(
        &self,
        role: TranscriptRole,
        text: String,
        is_final: bool,
        item_id: String,
        response_id: Option<String>,
    ) {
        self.transcript.publish(TranscriptResult {
            text,
            role,
            is_final,
            item_id: non_empty(item_id),
            response_id: response_id.and_then(non_empty),
        });
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

// =============================================================================
// Mutable Session State
// =============================================================================

struct SessionInner {
    config: RealtimeConfig,
    state: ConversationState,
    conversation: Conversation,
    audio: AudioBufferManager,
    session_id: Option<String>,
    current_response_id: Option<String>,
    /// Responses cancelled by `interrupt` whose trailing events may still arrive
    cancelled_responses: HashSet<String>,
    /// Cancels sent before the server announced the response id
    unnamed_cancels: u32,
    /// call_id -> function name, from `response.output_item.added`
    pending_calls: HashMap<String, String>,
    rate_limits: Vec<RateLimit>,
    /// Bumped whenever a turn ends early; tool results from an older turn do
    /// not trigger a follow-up response.
    turn: u64,
}

impl SessionInner {
    fn new(config: RealtimeConfig) -> Self {
        let audio = AudioBufferManager::new(config.session.input_audio_format);
        Self {
            config,
            state: ConversationState::Idle,
            conversation: Conversation::new(),
            audio,
            session_id: None,
            current_response_id: None,
            cancelled_responses: HashSet::new(),
            unnamed_cancels: 0,
            pending_calls: HashMap::new(),
            rate_limits: Vec::new(),
            turn: 0,
        }
    }

    fn transition(&mut self, to: ConversationState, feeds: &SessionFeeds) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!("Session state {} -> {}", from, to);
        feeds.state.publish(StateChange { from, to });
    }

    fn require_active(&self) -> RealtimeResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(RealtimeError::NotConnected)
        }
    }

    fn require_idle_turn(&self) -> RealtimeResult<()> {
        self.require_active()?;
        if self.state.is_responding() {
            return Err(RealtimeError::InvalidState(format!(
                "a response is already in progress ({}); interrupt it first",
                self.state
            )));
        }
        Ok(())
    }

    /// Mark the in-flight response as cancelled and return its id.
    fn cancel_current_response(&mut self) -> Option<String> {
        match self.current_response_id.take() {
            Some(response_id) => {
                self.cancelled_responses.insert(response_id.clone());
                Some(response_id)
            }
            None => {
                // The server creates responses in request order, so the next
                // `response.created` is the one this cancel hits.
                self.unnamed_cancels += 1;
                None
            }
        }
    }

    /// Record a `response.created`. Returns false when the response was
    /// already cancelled.
    fn response_started(&mut self, response_id: String) -> bool {
        if self.unnamed_cancels > 0 {
            self.unnamed_cancels -= 1;
            self.cancelled_responses.insert(response_id);
            return false;
        }
        self.current_response_id = Some(response_id);
        true
    }

    /// Record a `response.done`. Returns true when it ends the current turn.
    fn response_finished(&mut self, response_id: &str) -> bool {
        if self.cancelled_responses.remove(response_id) {
            return false;
        }
        if !self.is_current_response(response_id) {
            return false;
        }
        self.current_response_id = None;
        true
    }

    fn is_current_response(&self, response_id: &str) -> bool {
        !self.cancelled_responses.contains(response_id)
            && self
                .current_response_id
                .as_deref()
                .is_none_or(|current| current == response_id)
    }

    /// Forget everything tied to the server-side session.
    fn reset_remote(&mut self) {
        self.session_id = None;
        self.current_response_id = None;
        self.cancelled_responses.clear();
        self.unnamed_cancels = 0;
        self.pending_calls.clear();
        self.audio.reset();
    }

    /// `session.update` payload with registered tool descriptors merged over
    /// the configured ones.
    fn wire_session(&self, tools: &ToolBridge) -> SessionConfig {
        let mut wire = SessionConfig::from(&self.config.session);
        let registered = tools.definitions();
        if !registered.is_empty() {
            let mut merged: Vec<ToolDefinition> = self
                .config
                .session
                .tools
                .iter()
                .filter(|tool| !registered.iter().any(|r| r.name == tool.name))
                .cloned()
                .collect();
            merged.extend(registered);
            wire.tools = Some(merged);
        }
        wire
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Default)]
struct Background {
    cancel: Option<CancellationToken>,
    event_loop: Option<JoinHandle<()>>,
}

pub struct RealtimeSession {
    inner: Arc<Mutex<SessionInner>>,
    transport: Arc<Transport>,
    tools: Arc<ToolBridge>,
    feeds: Arc<SessionFeeds>,
    background: parking_lot::Mutex<Background>,
    tool_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
}

impl RealtimeSession {
    pub fn new(config: RealtimeConfig) -> Self {
        let transport = Transport::new(config.transport.clone());
        Self {
            inner: Arc::new(Mutex::new(SessionInner::new(config))),
            transport: Arc::new(transport),
            tools: Arc::new(ToolBridge::new()),
            feeds: Arc::new(SessionFeeds::new()),
            background: parking_lot::Mutex::new(Background::default()),
            tool_tasks: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect, push the session configuration and enter `ready`.
    ///
    /// Allowed from `idle` and `error`. The local conversation starts empty.
    pub async fn start(&self) -> RealtimeResult<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(
            inner.state,
            ConversationState::Idle | ConversationState::Error
        ) {
            return Err(RealtimeError::InvalidState(format!(
                "cannot start a session in state {}",
                inner.state
            )));
        }

        // Leftovers of a run that ended in error.
        self.stop_background().await;

        self.feeds.reopen();
        inner.conversation.clear();
        inner.reset_remote();
        inner.rate_limits.clear();
        let format = inner.config.session.input_audio_format;
        inner.audio.set_format(format);
        inner.transition(ConversationState::Connecting, &self.feeds);

        if let Err(e) = inner.config.validate() {
            tracing::error!("Refusing to start session: {}", e);
            inner.transition(ConversationState::Error, &self.feeds);
            return Err(e);
        }

        let url = inner.config.connection_url();
        let headers = inner.config.connection_headers();
        if let Err(e) = self.transport.connect(&url, &headers).await {
            tracing::error!("Failed to connect session: {}", e);
            inner.transition(ConversationState::Error, &self.feeds);
            return Err(e);
        }

        let update = ClientEvent::session_update(inner.wire_session(&self.tools));
        if let Err(e) = self.transport.send_event(update).await {
            tracing::error!("Failed to push session configuration: {}", e);
            self.transport.disconnect().await;
            inner.transition(ConversationState::Error, &self.feeds);
            return Err(e);
        }

        self.spawn_event_loop();
        inner.transition(ConversationState::Ready, &self.feeds);
        tracing::info!("Realtime session started with model {}", inner.config.session.model);
        Ok(())
    }

    /// Close the connection, stop background work and finish every feed.
    ///
    /// Valid from any state.
    pub async fn end(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ConversationState::Idle {
                inner.transition(ConversationState::Disconnecting, &self.feeds);
            }
        }

        self.stop_background().await;
        self.transport.disconnect().await;

        {
            let mut inner = self.inner.lock().await;
            inner.reset_remote();
            inner.transition(ConversationState::Idle, &self.feeds);
        }
        self.feeds.finish();
        tracing::info!("Realtime session ended");
    }

    fn spawn_event_loop(&self) {
        let cancel = CancellationToken::new();
        let event_loop = EventLoop {
            inner: self.inner.clone(),
            transport: self.transport.clone(),
            tools: self.tools.clone(),
            feeds: self.feeds.clone(),
            tool_tasks: self.tool_tasks.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(event_loop.run(self.transport.receive()));

        let mut background = self.background.lock();
        background.cancel = Some(cancel);
        background.event_loop = Some(handle);
    }

    async fn stop_background(&self) {
        let (cancel, event_loop) = {
            let mut background = self.background.lock();
            (background.cancel.take(), background.event_loop.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        // Aborted rather than joined: both may be parked on the session lock.
        let tool_tasks: Vec<JoinHandle<()>> = self.tool_tasks.lock().drain(..).collect();
        for handle in event_loop.into_iter().chain(tool_tasks) {
            handle.abort();
            let _ = handle.await;
        }
    }

    // -------------------------------------------------------------------------
    // Turn Commands
    // -------------------------------------------------------------------------

    /// Add a user text message and request a response.
    ///
    /// The item enters the local conversation immediately; the server's echo
    /// of it is recognised by id and not appended twice. While a response is
    /// in flight this fails with `InvalidState`; interrupt it first.
    pub async fn send_text(&self, text: impl Into<String>) -> RealtimeResult<ConversationItem> {
        let mut inner = self.inner.lock().await;
        inner.require_idle_turn()?;

        let item = ConversationItem::user_text(text);
        inner.conversation.append(item.clone());
        if let Err(e) = self
            .transport
            .send_event(ClientEvent::item_create(item.clone()))
            .await
        {
            if let Some(id) = item.id.as_deref() {
                inner.conversation.delete(id);
            }
            return Err(e);
        }
        self.transport
            .send_event(ClientEvent::response_create())
            .await?;

        inner.turn += 1;
        inner.transition(ConversationState::Processing, &self.feeds);
        Ok(item)
    }

    pub async fn start_listening(&self) -> RealtimeResult<()> {
        let mut inner = self.inner.lock().await;
        inner.require_active()?;
        match inner.state {
            ConversationState::Listening => Ok(()),
            ConversationState::Ready => {
                inner.transition(ConversationState::Listening, &self.feeds);
                Ok(())
            }
            state => Err(RealtimeError::InvalidState(format!(
                "cannot listen while {state}; interrupt the response first"
            ))),
        }
    }

    /// Flush and commit buffered input audio.
    ///
    /// With manual turn detection this also requests the response. A no-op
    /// once the server already took the turn.
    pub async fn stop_listening(&self) -> RealtimeResult<()> {
        let mut inner = self.inner.lock().await;
        inner.require_active()?;
        if inner.state.is_responding() {
            tracing::debug!("stop_listening ignored while {}", inner.state);
            return Ok(());
        }

        let flush = inner.audio.commit(&*self.transport).await?;
        self.feeds.publish_levels(&flush);

        if !flush.committed {
            tracing::debug!("No input audio to commit");
            inner.transition(ConversationState::Ready, &self.feeds);
            return Ok(());
        }

        if inner.config.session.turn_detection.is_manual() {
            self.transport
                .send_event(ClientEvent::response_create())
                .await?;
        }
        inner.transition(ConversationState::Processing, &self.feeds);
        Ok(())
    }

    /// Buffer raw input audio in the configured input format.
    ///
    /// Full chunks are transmitted right away and each yields one value on the
    /// input level feed.
    pub async fn append_audio(&self, data: &[u8]) -> RealtimeResult<()> {
        let mut inner = self.inner.lock().await;
        inner.require_active()?;
        let flush = inner.audio.append(data, &*self.transport).await?;
        self.feeds.publish_levels(&flush);
        Ok(())
    }

    pub async fn clear_audio(&self) -> RealtimeResult<()> {
        let mut inner = self.inner.lock().await;
        inner.require_active()?;
        inner.audio.clear(&*self.transport).await
    }

    /// Cancel the in-flight response.
    ///
    /// Tool results still pending for the interrupted turn are submitted but
    /// do not start a new response. Output the server still streams for the
    /// cancelled response is dropped.
    pub async fn interrupt(&self) -> RealtimeResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_responding() {
            tracing::debug!("Nothing to interrupt while {}", inner.state);
            return Ok(());
        }

        let response_id = inner.cancel_current_response();
        inner.turn += 1;
        self.transport
            .send_event(ClientEvent::response_cancel(response_id))
            .await?;
        inner.transition(ConversationState::Ready, &self.feeds);
        Ok(())
    }

    /// Request a response without adding input first.
    pub async fn create_response(&self) -> RealtimeResult<()> {
        let mut inner = self.inner.lock().await;
        inner.require_idle_turn()?;
        self.transport
            .send_event(ClientEvent::response_create())
            .await?;
        inner.transition(ConversationState::Processing, &self.feeds);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Configuration & Tools
    // -------------------------------------------------------------------------

    /// Replace the session configuration, pushing it when connected.
    pub async fn update_session(&self, session: SessionConfiguration) -> RealtimeResult<()> {
        session.validate()?;
        let mut inner = self.inner.lock().await;
        inner.audio.set_format(session.input_audio_format);
        inner.config.session = session;
        self.push_configuration(&inner).await
    }

    /// Register an executor without advertising it to the server.
    pub fn register_tool<F, Fut>(&self, name: impl Into<String>, executor: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.tools.register(name, executor);
    }

    /// Register an executor with its descriptor; a live session receives the
    /// updated tool list right away.
    pub async fn register_tool_with_definition<F, Fut>(
        &self,
        definition: ToolDefinition,
        executor: F,
    ) -> RealtimeResult<()>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.tools.register_with_definition(definition, executor);
        let inner = self.inner.lock().await;
        self.push_configuration(&inner).await
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.tools.unregister(name)
    }

    async fn push_configuration(&self, inner: &SessionInner) -> RealtimeResult<()> {
        if !inner.state.is_active() {
            return Ok(());
        }
        let update = ClientEvent::session_update(inner.wire_session(&self.tools));
        self.transport.send_event(update).await
    }

    // -------------------------------------------------------------------------
    // Conversation Edits
    // -------------------------------------------------------------------------

    /// Ask the server to truncate an item; applied locally on its echo.
    pub async fn truncate_item(
        &self,
        item_id: impl Into<String>,
        content_index: u32,
        audio_end_ms: u32,
    ) -> RealtimeResult<()> {
        let inner = self.inner.lock().await;
        inner.require_active()?;
        self.transport
            .send_event(ClientEvent::ConversationItemTruncate {
                item_id: item_id.into(),
                content_index,
                audio_end_ms,
            })
            .await
    }

    /// Ask the server to delete an item; applied locally on its echo.
    pub async fn delete_item(&self, item_id: impl Into<String>) -> RealtimeResult<()> {
        let inner = self.inner.lock().await;
        inner.require_active()?;
        self.transport
            .send_event(ClientEvent::ConversationItemDelete {
                item_id: item_id.into(),
            })
            .await
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    pub async fn state(&self) -> ConversationState {
        self.inner.lock().await.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Snapshot of the local conversation.
    pub async fn items(&self) -> Vec<ConversationItem> {
        self.inner.lock().await.conversation.items().to_vec()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.lock().await.session_id.clone()
    }

    pub async fn rate_limits(&self) -> Vec<RateLimit> {
        self.inner.lock().await.rate_limits.clone()
    }

    pub async fn configuration(&self) -> SessionConfiguration {
        self.inner.lock().await.config.session.clone()
    }

    pub fn tools(&self) -> &ToolBridge {
        &self.tools
    }

    pub fn subscribe_transcripts(&self) -> FeedSubscription<TranscriptResult> {
        self.feeds.transcript.subscribe()
    }

    pub fn subscribe_input_levels(&self) -> FeedSubscription<f32> {
        self.feeds.input_level.subscribe()
    }

    pub fn subscribe_state_changes(&self) -> FeedSubscription<StateChange> {
        self.feeds.state.subscribe()
    }

    pub fn subscribe_output_audio(&self) -> FeedSubscription<RealtimeAudioData> {
        self.feeds.output_audio.subscribe()
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        let background = self.background.get_mut();
        if let Some(cancel) = background.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = background.event_loop.take() {
            handle.abort();
        }
        for handle in self.tool_tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

// =============================================================================
// Event Loop
// =============================================================================

struct EventLoop {
    inner: Arc<Mutex<SessionInner>>,
    transport: Arc<Transport>,
    tools: Arc<ToolBridge>,
    feeds: Arc<SessionFeeds>,
    tool_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    cancel: CancellationToken,
}

impl EventLoop {
    async fn run(self, events: impl Stream<Item = TransportEvent> + Send + 'static) {
        let mut events = std::pin::pin!(events);
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.next() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                TransportEvent::Frame(frame) => match messages::decode(&frame) {
                    Ok(server_event) => self.handle_server_event(server_event).await,
                    Err(e) => tracing::warn!("Dropping inbound frame: {}", e),
                },
                TransportEvent::Reconnecting { attempt, delay } => {
                    tracing::warn!(
                        "Session connection lost, reconnecting (attempt {} in {}ms)",
                        attempt,
                        delay.as_millis()
                    );
                    let mut inner = self.inner.lock().await;
                    inner.transition(ConversationState::Reconnecting, &self.feeds);
                }
                TransportEvent::Reconnected { attempt } => self.on_reconnected(attempt).await,
                TransportEvent::Failed(e) => {
                    tracing::error!("Realtime session failed: {}", e);
                    let mut inner = self.inner.lock().await;
                    inner.reset_remote();
                    inner.transition(ConversationState::Error, &self.feeds);
                }
            }
        }
        tracing::debug!("Session event loop finished");
    }

    async fn on_reconnected(&self, attempt: u32) {
        let mut inner = self.inner.lock().await;
        inner.reset_remote();
        inner.turn += 1;

        let update = ClientEvent::session_update(inner.wire_session(&self.tools));
        match self.transport.send_event(update).await {
            Ok(()) => {
                tracing::info!(
                    "Session configuration restored after reconnection attempt {}",
                    attempt
                );
                inner.transition(ConversationState::Ready, &self.feeds);
            }
            Err(e) => tracing::error!("Failed to restore session configuration: {}", e),
        }
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        let mut inner = self.inner.lock().await;
        if let Some(response_id) = event.response_id()
            && !matches!(
                event,
                ServerEvent::ResponseCreated { .. }
                    | ServerEvent::ResponseDone { .. }
                    | ServerEvent::OutputItemAdded { .. }
                    | ServerEvent::OutputItemDone { .. }
            )
            && !inner.is_current_response(response_id)
        {
            tracing::debug!(
                "Dropping {} from cancelled response {}",
                event.event_type(),
                response_id
            );
            return;
        }

        match event {
            ServerEvent::Error { error } => {
                tracing::warn!(
                    "Server error {} ({}): {}",
                    error.error_type,
                    error.code.as_deref().unwrap_or("-"),
                    error.message
                );
            }
            ServerEvent::SessionCreated { session } => {
                tracing::info!("Server session {} created", session.id);
                inner.session_id = Some(session.id);
            }
            ServerEvent::SessionUpdated { session } => {
                tracing::debug!("Server session {} updated", session.id);
            }
            ServerEvent::SpeechStarted { .. } => {
                if inner.state == ConversationState::Ready {
                    inner.transition(ConversationState::Listening, &self.feeds);
                }
            }
            ServerEvent::SpeechStopped { .. } | ServerEvent::InputAudioBufferCommitted { .. } => {
                if inner.state == ConversationState::Listening {
                    inner.transition(ConversationState::Processing, &self.feeds);
                }
            }
            ServerEvent::InputAudioBufferCleared => {
                tracing::debug!("Input audio buffer cleared");
            }
            ServerEvent::ConversationItemCreated { item, .. } => {
                inner.conversation.append(item);
            }
            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
                ..
            } => {
                self.feeds
                    .publish_transcript(TranscriptRole::User, transcript, true, item_id, None);
            }
            ServerEvent::TranscriptionFailed { item_id, error, .. } => {
                tracing::warn!("Transcription of {} failed: {}", item_id, error.message);
            }
            ServerEvent::ConversationItemTruncated {
                item_id,
                content_index,
                ..
            } => {
                if !inner.conversation.truncate(&item_id, content_index) {
                    tracing::debug!("Truncated item {} is not in the conversation", item_id);
                }
            }
            ServerEvent::ConversationItemDeleted { item_id } => {
                inner.conversation.delete(&item_id);
            }
            ServerEvent::ResponseCreated { response } => {
                if !inner.response_started(response.id.clone()) {
                    tracing::debug!("Response {} was cancelled before it started", response.id);
                } else if matches!(
                    inner.state,
                    ConversationState::Ready | ConversationState::Listening
                ) {
                    inner.transition(ConversationState::Processing, &self.feeds);
                }
            }
            ServerEvent::ResponseDone { response } => {
                tracing::debug!("Response {} finished with status {}", response.id, response.status);
                if inner.response_finished(&response.id) && inner.state.is_responding() {
                    inner.transition(ConversationState::Ready, &self.feeds);
                }
            }
            ServerEvent::OutputItemAdded { item, .. } => {
                if item.kind == ItemKind::FunctionCall
                    && let (Some(call_id), Some(name)) = (item.call_id.clone(), item.name.clone())
                {
                    inner.pending_calls.insert(call_id, name);
                }
                inner.conversation.append(item);
            }
            ServerEvent::OutputItemDone { item, .. } => {
                inner.conversation.complete(item);
            }
            ServerEvent::ContentPartAdded { .. } | ServerEvent::ContentPartDone { .. } => {}
            ServerEvent::TextDelta {
                response_id,
                item_id,
                delta,
                ..
            }
            | ServerEvent::AudioTranscriptDelta {
                response_id,
                item_id,
                delta,
                ..
            } => {
                self.feeds.publish_transcript(
                    TranscriptRole::Assistant,
                    delta,
                    false,
                    item_id,
                    Some(response_id),
                );
            }
            ServerEvent::TextDone {
                response_id,
                item_id,
                text,
                ..
            }
            | ServerEvent::AudioTranscriptDone {
                response_id,
                item_id,
                transcript: text,
                ..
            } => {
                self.feeds.publish_transcript(
                    TranscriptRole::Assistant,
                    text,
                    true,
                    item_id,
                    Some(response_id),
                );
            }
            ServerEvent::AudioDelta {
                response_id,
                item_id,
                delta,
                ..
            } => match ServerEvent::decode_audio_delta(&delta) {
                Ok(data) => {
                    if inner.state == ConversationState::Processing {
                        inner.transition(ConversationState::Speaking, &self.feeds);
                    }
                    self.feeds.output_audio.publish(RealtimeAudioData {
                        data: Bytes::from(data),
                        format: inner.config.session.output_audio_format,
                        response_id,
                        item_id,
                    });
                }
                Err(e) => tracing::warn!("Dropping undecodable audio delta: {}", e),
            },
            ServerEvent::AudioDone { .. } => {
                if inner.state == ConversationState::Speaking {
                    inner.transition(ConversationState::Ready, &self.feeds);
                }
            }
            ServerEvent::FunctionCallArgumentsDelta { .. } => {}
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
                item_id,
                ..
            } => {
                let recorded = inner.pending_calls.remove(&call_id);
                let name = name.or(recorded).unwrap_or_else(|| {
                    tracing::warn!("Function call {} arrived without a name", call_id);
                    String::new()
                });
                let call = FunctionCallRequest {
                    call_id,
                    name,
                    arguments,
                    item_id: non_empty(item_id),
                };
                self.spawn_tool_call(call, inner.turn);
            }
            ServerEvent::RateLimitsUpdated { rate_limits } => {
                inner.rate_limits = rate_limits;
            }
            ServerEvent::Unknown { event_type, .. } => {
                tracing::debug!("Ignoring unknown server event {}", event_type);
            }
        }
    }

    fn spawn_tool_call(&self, call: FunctionCallRequest, turn: u64) {
        let inner = self.inner.clone();
        let transport = self.transport.clone();
        let tools = self.tools.clone();
        let feeds = self.feeds.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let work = async {
                let output = tools.resolve(&call).await;

                let mut inner = inner.lock().await;
                inner.conversation.append(output.clone());
                let continue_turn = inner.turn == turn;
                if !continue_turn {
                    tracing::info!(
                        "Tool call {}: {}; submitting output without a follow-up response",
                        call.call_id,
                        RealtimeError::TurnCancelled
                    );
                }

                match tools.submit(output, &*transport, continue_turn).await {
                    Ok(()) => {
                        if continue_turn && inner.state == ConversationState::Ready {
                            inner.transition(ConversationState::Processing, &feeds);
                        }
                    }
                    Err(e) => tracing::error!(
                        "Failed to submit output of tool call {}: {}",
                        call.call_id,
                        e
                    ),
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = work => {}
            }
        });

        let mut tool_tasks = self.tool_tasks.lock();
        tool_tasks.retain(|task| !task.is_finished());
        tool_tasks.push(handle);
    }
}
