//! Base traits and types for the realtime session client.
//!
//! This module defines the error taxonomy, reconnection policy, connection
//! and conversation state enums, and the user-facing session configuration
//! shared by the transport, audio manager, tool bridge and session controller.
//!
//! # Audio Format
//!
//! Input and output audio default to PCM 16-bit signed little-endian at 24kHz.
//! G.711 μ-law and A-law are accepted as alternative wire formats.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::config::{
    AudioFormat, DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_URL, DEFAULT_VOICE, Modality,
    PROTOCOL_VERSION_HEADER,
};
use super::messages::ClientEvent;
use super::transport::TransportConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RealtimeError {
    /// Network level failure. Retried by the transport, terminal once the
    /// reconnection policy is exhausted.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Missing or rejected credential
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid address, header or session parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Malformed inbound frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Outbound event could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A registered tool failed
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// The turn a result belonged to was interrupted
    #[error("Turn cancelled")]
    TurnCancelled,

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Command not valid in the current conversation state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Serialization(err.to_string())
    }
}

// =============================================================================
// Event Sink
// =============================================================================

/// Destination for encoded client events.
///
/// The transport implements this; the audio manager and tool bridge only see
/// the trait so they can be driven against a recording sink in tests.
#[async_trait]
pub trait ClientEventSink: Send + Sync {
    /// Encode and transmit one client event, resolving once the socket writer
    /// accepted the frame.
    async fn send_event(&self, event: ClientEvent) -> RealtimeResult<()>;
}

// =============================================================================
// Reconnection Policy
// =============================================================================

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionConfig {
    /// Enable automatic reconnection on connection loss.
    /// Default: true
    pub enabled: bool,

    /// Maximum number of reconnection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    /// Default: 5
    pub max_attempts: u32,

    /// Delay before the first attempt (milliseconds).
    /// Default: 1000ms
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds).
    /// Default: 30000ms
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectionConfig {
    /// Create a config with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (1-based) using
    /// exponential backoff. Returns the delay in milliseconds.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // base_delay * multiplier^(attempt-1)
        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        delay.min(self.max_delay_ms as f64) as u64
    }

    /// Backoff delay for `attempt` as a [`Duration`].
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_delay(attempt))
    }

    /// Whether another attempt may start after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        if !self.enabled {
            return false;
        }
        self.max_attempts == 0 || attempts_made < self.max_attempts
    }
}

// =============================================================================
// States
// =============================================================================

/// Connection state of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Conversation state driven by the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Processing,
    Speaking,
    Ready,
    Reconnecting,
    Disconnecting,
    Error,
}

impl ConversationState {
    /// States in which a live connection is expected and turn commands apply.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConversationState::Listening
                | ConversationState::Processing
                | ConversationState::Speaking
                | ConversationState::Ready
        )
    }

    /// Whether a response is currently in flight.
    pub fn is_responding(&self) -> bool {
        matches!(
            self,
            ConversationState::Processing | ConversationState::Speaking
        )
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationState::Idle => "idle",
            ConversationState::Connecting => "connecting",
            ConversationState::Listening => "listening",
            ConversationState::Processing => "processing",
            ConversationState::Speaking => "speaking",
            ConversationState::Ready => "ready",
            ConversationState::Reconnecting => "reconnecting",
            ConversationState::Disconnecting => "disconnecting",
            ConversationState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A state transition published on the state feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConversationState,
    pub to: ConversationState,
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Turn detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetectionConfig {
    /// Server-side voice activity detection
    ServerVad {
        /// Activation threshold (0.0 to 1.0)
        #[serde(default = "default_vad_threshold")]
        threshold: f32,
        /// Audio to include before speech starts (ms)
        #[serde(default = "default_prefix_padding_ms")]
        prefix_padding_ms: u32,
        /// Silence duration that ends a turn (ms)
        #[serde(default = "default_silence_duration_ms")]
        silence_duration_ms: u32,
        /// Whether the server creates a response when the turn ends
        #[serde(default = "default_true")]
        create_response: bool,
    },
    /// Semantic turn detection
    SemanticVad {
        #[serde(default)]
        eagerness: Option<String>,
        #[serde(default = "default_true")]
        create_response: bool,
    },
    /// Manual turns: the client commits audio and requests responses itself
    None,
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_prefix_padding_ms() -> u32 {
    300
}

fn default_silence_duration_ms() -> u32 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        TurnDetectionConfig::ServerVad {
            threshold: default_vad_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_silence_duration_ms(),
            create_response: true,
        }
    }
}

impl TurnDetectionConfig {
    /// True when the client is responsible for committing and responding.
    pub fn is_manual(&self) -> bool {
        matches!(self, TurnDetectionConfig::None)
    }
}

/// Tool descriptor advertised to the server in the session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool type (always "function")
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

fn default_tool_type() -> String {
    "function".to_string()
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: default_tool_type(),
            name: name.into(),
            description: Some(description.into()),
            parameters: Some(parameters),
        }
    }
}

/// Session parameters pushed to the server with `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    pub model: String,
    pub voice: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// "auto", "none", "required" or a function name
    #[serde(default)]
    pub tool_choice: Option<String>,
    #[serde(default)]
    pub turn_detection: TurnDetectionConfig,
    #[serde(default)]
    pub input_audio_format: AudioFormat,
    #[serde(default)]
    pub output_audio_format: AudioFormat,
    /// Model used to transcribe user audio, transcription is off when unset
    #[serde(default)]
    pub input_audio_transcription: Option<String>,
    #[serde(default = "default_modalities")]
    pub modalities: Vec<Modality>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_response_output_tokens: Option<u32>,
}

fn default_modalities() -> Vec<Modality> {
    vec![Modality::Text, Modality::Audio]
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instructions: None,
            tools: Vec::new(),
            tool_choice: None,
            turn_detection: TurnDetectionConfig::default(),
            input_audio_format: AudioFormat::default(),
            output_audio_format: AudioFormat::default(),
            input_audio_transcription: None,
            modalities: default_modalities(),
            temperature: None,
            max_response_output_tokens: None,
        }
    }
}

impl SessionConfiguration {
    pub fn validate(&self) -> RealtimeResult<()> {
        if self.model.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "model must not be empty".to_string(),
            ));
        }
        if self.voice.trim().is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "voice must not be empty".to_string(),
            ));
        }
        if let Some(temperature) = self.temperature
            && !(0.6..=1.2).contains(&temperature)
        {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "temperature {temperature} outside 0.6..=1.2"
            )));
        }
        if self.modalities.is_empty() {
            return Err(RealtimeError::InvalidConfiguration(
                "at least one modality is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a session needs to reach the service.
#[derive(Clone)]
pub struct RealtimeConfig {
    pub api_key: String,
    /// Base endpoint; `model` is added as a query parameter when missing
    pub url: String,
    pub session: SessionConfiguration,
    pub transport: TransportConfig,
    /// Additional request headers sent with every (re)connection
    pub extra_headers: Vec<(String, String)>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: DEFAULT_REALTIME_URL.to_string(),
            session: SessionConfiguration::default(),
            transport: TransportConfig::default(),
            extra_headers: Vec::new(),
        }
    }
}

impl fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("api_key", &"[REDACTED]")
            .field("url", &self.url)
            .field("session", &self.session)
            .field("transport", &self.transport)
            .field("extra_headers", &self.extra_headers.len())
            .finish()
    }
}

impl RealtimeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> RealtimeResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(RealtimeError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }
        self.session.validate()
    }

    /// Endpoint with the configured model as query parameter.
    pub fn connection_url(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut url) => {
                if !url.query_pairs().any(|(key, _)| key == "model") {
                    url.query_pairs_mut()
                        .append_pair("model", &self.session.model);
                }
                url.to_string()
            }
            // Rejected with a configuration error by the transport.
            Err(_) => self.url.clone(),
        }
    }

    pub fn connection_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key),
            ),
            (
                PROTOCOL_VERSION_HEADER.0.to_string(),
                PROTOCOL_VERSION_HEADER.1.to_string(),
            ),
        ];
        headers.extend(self.extra_headers.iter().cloned());
        headers
    }
}

// =============================================================================
// Feed Payloads
// =============================================================================

/// Who produced a transcript increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A transcript increment published on the transcript feed.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptResult {
    /// The increment for deltas, the full text when `is_final`
    pub text: String,
    pub role: TranscriptRole,
    pub is_final: bool,
    pub item_id: Option<String>,
    pub response_id: Option<String>,
}

/// A decoded chunk of response audio.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeAudioData {
    pub data: Bytes,
    pub format: AudioFormat,
    pub response_id: String,
    pub item_id: String,
}

impl RealtimeAudioData {
    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate()
    }
}

/// A server-requested function invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallRequest {
    pub call_id: String,
    pub name: String,
    /// Raw JSON argument payload as sent by the server
    pub arguments: String,
    pub item_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_backoff_sequence() {
        let config = ReconnectionConfig::default();
        let delays: Vec<u64> = (1..=5).map(|n| config.calculate_delay(n)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_reconnection_delay_is_capped() {
        let config = ReconnectionConfig::default();
        assert_eq!(config.calculate_delay(6), 30000);
        assert_eq!(config.calculate_delay(20), 30000);
        assert_eq!(config.delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_should_retry_stops_at_max_attempts() {
        let config = ReconnectionConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));
        assert!(!ReconnectionConfig::disabled().should_retry(0));

        let unlimited = ReconnectionConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(unlimited.should_retry(1000));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConversationState::Disconnecting.to_string(), "disconnecting");
        assert!(ConversationState::Speaking.is_responding());
        assert!(!ConversationState::Idle.is_active());
    }

    #[test]
    fn test_turn_detection_serialization() {
        let json = serde_json::to_value(TurnDetectionConfig::default()).unwrap();
        assert_eq!(json["type"], "server_vad");
        assert_eq!(json["silence_duration_ms"], 500);

        let manual: TurnDetectionConfig = serde_json::from_str(r#"{"type":"none"}"#).unwrap();
        assert!(manual.is_manual());
    }

    #[test]
    fn test_session_configuration_validation() {
        assert!(SessionConfiguration::default().validate().is_ok());

        let bad = SessionConfiguration {
            model: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(RealtimeError::InvalidConfiguration(_))
        ));

        let hot = SessionConfiguration {
            temperature: Some(2.0),
            ..Default::default()
        };
        assert!(hot.validate().is_err());
    }

    #[test]
    fn test_realtime_config_requires_api_key() {
        let config = RealtimeConfig::default();
        assert!(matches!(
            config.validate(),
            Err(RealtimeError::AuthenticationFailed(_))
        ));
        assert!(RealtimeConfig::new("sk-test").validate().is_ok());
    }

    #[test]
    fn test_connection_url_appends_model() {
        let config = RealtimeConfig::new("sk-test");
        assert_eq!(
            config.connection_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );

        let pinned = RealtimeConfig {
            url: "wss://example.com/realtime?model=custom".to_string(),
            ..RealtimeConfig::new("sk-test")
        };
        assert_eq!(pinned.connection_url(), "wss://example.com/realtime?model=custom");
    }

    #[test]
    fn test_connection_headers_and_redaction() {
        let config = RealtimeConfig {
            extra_headers: vec![("X-Trace".to_string(), "1".to_string())],
            ..RealtimeConfig::new("sk-secret")
        };
        let headers = config.connection_headers();
        assert_eq!(headers[0], ("Authorization".to_string(), "Bearer sk-secret".to_string()));
        assert_eq!(headers[1].1, "realtime=v1");
        assert_eq!(headers.len(), 3);
        assert!(!format!("{config:?}").contains("sk-secret"));
    }

    #[test]
    fn test_tool_definition_wire_shape() {
        let tool = ToolDefinition::function(
            "get_weather",
            "Look up the weather",
            serde_json::json!({"type": "object"}),
        );
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["name"], "get_weather");
    }
}
