//! Realtime WebSocket event codec.
//!
//! Every frame is a JSON object carrying a string `type` discriminator that
//! uniquely identifies the payload shape.
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - session.update - Update session configuration
//! - input_audio_buffer.append - Append audio to buffer
//! - input_audio_buffer.commit - Commit audio buffer
//! - input_audio_buffer.clear - Clear audio buffer
//! - conversation.item.create - Add item to conversation
//! - conversation.item.truncate - Drop the unplayed tail of an item
//! - conversation.item.delete - Delete conversation item
//! - response.create - Generate a response
//! - response.cancel - Cancel current response
//!
//! Server events (received from server):
//! - session.created / session.updated
//! - input_audio_buffer.speech_started / speech_stopped / committed / cleared
//! - conversation.item.created / truncated / deleted
//! - conversation.item.input_audio_transcription.completed / failed
//! - response.created / response.done
//! - response.output_item.added / done, response.content_part.added / done
//! - response.text.delta / done, response.audio_transcript.delta / done
//! - response.audio.delta / done
//! - response.function_call_arguments.delta / done
//! - rate_limits.updated
//! - error
//!
//! Discriminators outside this set decode to [`ServerEvent::Unknown`].

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::base::{
    RealtimeError, RealtimeResult, SessionConfiguration, ToolDefinition, TurnDetectionConfig,
};
use super::config::{AudioFormat, Modality};

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration as sent in `session.update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Response modalities (text, audio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,
    /// System instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Voice for audio output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<AudioFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<AudioFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<MaxTokens>,
}

impl From<&SessionConfiguration> for SessionConfig {
    fn from(config: &SessionConfiguration) -> Self {
        Self {
            modalities: Some(config.modalities.clone()),
            instructions: config.instructions.clone(),
            voice: Some(config.voice.clone()),
            input_audio_format: Some(config.input_audio_format),
            output_audio_format: Some(config.output_audio_format),
            input_audio_transcription: config
                .input_audio_transcription
                .as_ref()
                .map(|model| InputAudioTranscription {
                    model: model.clone(),
                }),
            turn_detection: Some(config.turn_detection.clone()),
            tools: (!config.tools.is_empty()).then(|| config.tools.clone()),
            tool_choice: config.tool_choice.clone(),
            temperature: config.temperature,
            max_response_output_tokens: config.max_response_output_tokens.map(MaxTokens::Number),
        }
    }
}

/// Maximum tokens configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxTokens {
    /// Specific number of tokens
    Number(u32),
    /// "inf"
    Infinite(InfiniteTokens),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InfiniteTokens {
    #[serde(rename = "inf")]
    Inf,
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Kind of a conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Message,
    FunctionCall,
    FunctionCallOutput,
    #[serde(other)]
    Other,
}

/// Author of a message item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    User,
    Assistant,
    System,
}

/// Completion status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Incomplete,
}

/// Conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ItemRole>,
    /// Ordered content parts (message items only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
    /// Call identity for function_call and function_call_output items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// JSON argument payload of a function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Result payload of a function call output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Content part within a conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Audio content (base64 encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Transcript of audio content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ContentPart {
    pub fn input_text(text: impl Into<String>) -> Self {
        Self {
            content_type: "input_text".to_string(),
            text: Some(text.into()),
            audio: None,
            transcript: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: Some(text.into()),
            audio: None,
            transcript: None,
        }
    }

    pub fn input_audio(data: &[u8]) -> Self {
        Self {
            content_type: "input_audio".to_string(),
            text: None,
            audio: Some(BASE64_STANDARD.encode(data)),
            transcript: None,
        }
    }
}

// =============================================================================
// Response Configuration
// =============================================================================

/// Per-response overrides for `response.create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<AudioFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<MaxTokens>,
    /// "auto" or "none" (out-of-band response)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

// =============================================================================
// Client Events (sent to server)
// =============================================================================

/// Client events sent to the realtime service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append audio to input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio data
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Create a conversation item
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        item: ConversationItem,
        /// Previous item ID to insert after
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_item_id: Option<String>,
    },

    /// Truncate a conversation item
    #[serde(rename = "conversation.item.truncate")]
    ConversationItemTruncate {
        item_id: String,
        content_index: u32,
        audio_end_ms: u32,
    },

    #[serde(rename = "conversation.item.delete")]
    ConversationItemDelete { item_id: String },

    /// Create a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },

    /// Cancel the in-flight response
    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

impl ClientEvent {
    /// Create an audio append event from raw bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }

    pub fn session_update(session: SessionConfig) -> Self {
        ClientEvent::SessionUpdate { session }
    }

    pub fn item_create(item: ConversationItem) -> Self {
        ClientEvent::ConversationItemCreate {
            item,
            previous_item_id: None,
        }
    }

    pub fn response_create() -> Self {
        ClientEvent::ResponseCreate { response: None }
    }

    pub fn response_cancel(response_id: Option<String>) -> Self {
        ClientEvent::ResponseCancel { response_id }
    }

    /// The wire discriminator of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::InputAudioBufferClear => "input_audio_buffer.clear",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ConversationItemTruncate { .. } => "conversation.item.truncate",
            ClientEvent::ConversationItemDelete { .. } => "conversation.item.delete",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel { .. } => "response.cancel",
        }
    }
}

// =============================================================================
// Server Events (received from server)
// =============================================================================

/// Discriminators with a typed [`ServerEvent`] variant.
static SERVER_EVENT_TYPES: phf::Set<&'static str> = phf::phf_set! {
    "error",
    "session.created",
    "session.updated",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "input_audio_buffer.committed",
    "input_audio_buffer.cleared",
    "conversation.item.created",
    "conversation.item.input_audio_transcription.completed",
    "conversation.item.input_audio_transcription.failed",
    "conversation.item.truncated",
    "conversation.item.deleted",
    "response.created",
    "response.done",
    "response.output_item.added",
    "response.output_item.done",
    "response.content_part.added",
    "response.content_part.done",
    "response.text.delta",
    "response.text.done",
    "response.audio_transcript.delta",
    "response.audio_transcript.done",
    "response.audio.delta",
    "response.audio.done",
    "response.function_call_arguments.delta",
    "response.function_call_arguments.done",
    "rate_limits.updated",
};

/// Server events received from the realtime service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated { session: Session },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: Session },

    /// Speech started (VAD detected speech)
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u64,
        #[serde(default)]
        item_id: String,
    },

    /// Speech stopped (VAD detected silence)
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u64,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        previous_item_id: Option<String>,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared,

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        previous_item_id: Option<String>,
        item: ConversationItem,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        item_id: String,
        #[serde(default)]
        content_index: u32,
        error: ApiError,
    },

    #[serde(rename = "conversation.item.truncated")]
    ConversationItemTruncated {
        item_id: String,
        content_index: u32,
        #[serde(default)]
        audio_end_ms: u32,
    },

    #[serde(rename = "conversation.item.deleted")]
    ConversationItemDeleted { item_id: String },

    #[serde(rename = "response.created")]
    ResponseCreated { response: Response },

    #[serde(rename = "response.done")]
    ResponseDone { response: Response },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        output_index: u32,
        item: ConversationItem,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        output_index: u32,
        item: ConversationItem,
    },

    #[serde(rename = "response.content_part.added")]
    ContentPartAdded {
        #[serde(default)]
        response_id: String,
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        part: ContentPart,
    },

    #[serde(rename = "response.content_part.done")]
    ContentPartDone {
        #[serde(default)]
        response_id: String,
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        part: ContentPart,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },

    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        text: String,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        transcript: String,
    },

    /// Audio data chunk
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        /// Base64-encoded audio delta
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        call_id: String,
        delta: String,
    },

    /// Function call arguments complete. `name` is absent on some server
    /// versions and is then recovered from the matching output item.
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments: String,
    },

    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated { rate_limits: Vec<RateLimit> },

    /// Any discriminator this client has no typed variant for.
    #[serde(skip)]
    Unknown { event_type: String, payload: Value },
}

impl ServerEvent {
    /// Decode base64 audio from an AudioDelta event.
    pub fn decode_audio_delta(delta: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(delta)
    }

    /// Response a streamed output event belongs to. `None` for events outside
    /// a response or when the server left the id out.
    pub fn response_id(&self) -> Option<&str> {
        let response_id = match self {
            ServerEvent::OutputItemAdded { response_id, .. }
            | ServerEvent::OutputItemDone { response_id, .. }
            | ServerEvent::ContentPartAdded { response_id, .. }
            | ServerEvent::ContentPartDone { response_id, .. }
            | ServerEvent::TextDelta { response_id, .. }
            | ServerEvent::TextDone { response_id, .. }
            | ServerEvent::AudioTranscriptDelta { response_id, .. }
            | ServerEvent::AudioTranscriptDone { response_id, .. }
            | ServerEvent::AudioDelta { response_id, .. }
            | ServerEvent::AudioDone { response_id, .. }
            | ServerEvent::FunctionCallArgumentsDelta { response_id, .. }
            | ServerEvent::FunctionCallArgumentsDone { response_id, .. } => response_id.as_str(),
            ServerEvent::ResponseCreated { response } | ServerEvent::ResponseDone { response } => {
                response.id.as_str()
            }
            _ => return None,
        };
        (!response_id.is_empty()).then_some(response_id)
    }

    /// The wire discriminator of this event.
    pub fn event_type(&self) -> &str {
        match self {
            ServerEvent::Error { .. } => "error",
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            ServerEvent::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            ServerEvent::InputAudioBufferCommitted { .. } => "input_audio_buffer.committed",
            ServerEvent::InputAudioBufferCleared => "input_audio_buffer.cleared",
            ServerEvent::ConversationItemCreated { .. } => "conversation.item.created",
            ServerEvent::TranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerEvent::TranscriptionFailed { .. } => {
                "conversation.item.input_audio_transcription.failed"
            }
            ServerEvent::ConversationItemTruncated { .. } => "conversation.item.truncated",
            ServerEvent::ConversationItemDeleted { .. } => "conversation.item.deleted",
            ServerEvent::ResponseCreated { .. } => "response.created",
            ServerEvent::ResponseDone { .. } => "response.done",
            ServerEvent::OutputItemAdded { .. } => "response.output_item.added",
            ServerEvent::OutputItemDone { .. } => "response.output_item.done",
            ServerEvent::ContentPartAdded { .. } => "response.content_part.added",
            ServerEvent::ContentPartDone { .. } => "response.content_part.done",
            ServerEvent::TextDelta { .. } => "response.text.delta",
            ServerEvent::TextDone { .. } => "response.text.done",
            ServerEvent::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerEvent::AudioTranscriptDone { .. } => "response.audio_transcript.done",
            ServerEvent::AudioDelta { .. } => "response.audio.delta",
            ServerEvent::AudioDone { .. } => "response.audio.done",
            ServerEvent::FunctionCallArgumentsDelta { .. } => {
                "response.function_call_arguments.delta"
            }
            ServerEvent::FunctionCallArgumentsDone { .. } => {
                "response.function_call_arguments.done"
            }
            ServerEvent::RateLimitsUpdated { .. } => "rate_limits.updated",
            ServerEvent::Unknown { event_type, .. } => event_type,
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Generate a fresh correlation id for an outbound event.
pub fn new_event_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("evt_{}", &id[..24])
}

/// Encode a client event into a text frame with a fresh `event_id`.
pub fn encode(event: &ClientEvent) -> RealtimeResult<String> {
    encode_with_id(event, &new_event_id())
}

/// Encode a client event into a text frame carrying `event_id`.
pub fn encode_with_id(event: &ClientEvent, event_id: &str) -> RealtimeResult<String> {
    let mut value = serde_json::to_value(event)?;
    if let Value::Object(map) = &mut value {
        map.insert("event_id".to_string(), Value::String(event_id.to_string()));
    }
    Ok(value.to_string())
}

/// Decode an inbound text frame.
///
/// Unrecognized discriminators yield [`ServerEvent::Unknown`]; malformed JSON,
/// a missing `type`, or a known type with a bad shape is a protocol error.
pub fn decode(frame: &str) -> RealtimeResult<ServerEvent> {
    let payload: Value = serde_json::from_str(frame)
        .map_err(|e| RealtimeError::Protocol(format!("malformed frame: {e}")))?;

    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RealtimeError::Protocol("frame has no string `type` field".to_string()))?
        .to_string();

    if !SERVER_EVENT_TYPES.contains(event_type.as_str()) {
        return Ok(ServerEvent::Unknown {
            event_type,
            payload,
        });
    }

    serde_json::from_value(payload)
        .map_err(|e| RealtimeError::Protocol(format!("invalid `{event_type}` event: {e}")))
}

/// Decode a client event frame. Used by test servers and for logging replays.
pub fn decode_client(frame: &str) -> RealtimeResult<ClientEvent> {
    serde_json::from_str(frame).map_err(|e| RealtimeError::Protocol(e.to_string()))
}

/// Encode a server event. `Unknown` events reproduce their original payload.
pub fn encode_server(event: &ServerEvent) -> RealtimeResult<String> {
    match event {
        ServerEvent::Unknown { payload, .. } => Ok(payload.to_string()),
        other => Ok(serde_json::to_string(other)?),
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// API error information.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// Client event that caused the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Session information echoed by the server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modalities: Vec<Modality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<AudioFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<AudioFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Response information.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Response {
    pub id: String,
    /// in_progress, completed, cancelled, failed or incomplete
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<ConversationItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Usage information.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// Rate limit information.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RateLimit {
    pub name: String,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the limit resets
    pub reset_seconds: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> ConversationItem {
        ConversationItem {
            id: Some("item_1".to_string()),
            kind: ItemKind::Message,
            status: Some(ItemStatus::Completed),
            role: Some(ItemRole::User),
            content: vec![ContentPart::input_text("Hello")],
            call_id: None,
            name: None,
            arguments: None,
            output: None,
        }
    }

    #[test]
    fn test_encode_adds_event_id() {
        let frame = encode(&ClientEvent::InputAudioBufferCommit).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.commit");
        let event_id = value["event_id"].as_str().unwrap();
        assert!(event_id.starts_with("evt_"));
        assert!(event_id.len() <= 32);
    }

    #[test]
    fn test_event_ids_are_unique() {
        assert_ne!(new_event_id(), new_event_id());
    }

    #[test]
    fn test_audio_append() {
        let data = vec![0u8, 1, 2, 3];
        let event = ClientEvent::audio_append(&data);
        match event {
            ClientEvent::InputAudioBufferAppend { audio } => {
                let decoded = BASE64_STANDARD.decode(&audio).unwrap();
                assert_eq!(decoded, data);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_session_update_serialization() {
        let config = SessionConfiguration {
            voice: "nova".to_string(),
            ..Default::default()
        };
        let event = ClientEvent::session_update(SessionConfig::from(&config));
        let value: Value = serde_json::from_str(&encode(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["voice"], "nova");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert!(value["session"].get("tools").is_none());
    }

    #[test]
    fn test_client_events_round_trip() {
        let events = vec![
            ClientEvent::session_update(SessionConfig::from(&SessionConfiguration::default())),
            ClientEvent::audio_append(&[1, 2, 3]),
            ClientEvent::InputAudioBufferCommit,
            ClientEvent::InputAudioBufferClear,
            ClientEvent::item_create(sample_item()),
            ClientEvent::ConversationItemTruncate {
                item_id: "item_1".to_string(),
                content_index: 0,
                audio_end_ms: 1500,
            },
            ClientEvent::ConversationItemDelete {
                item_id: "item_1".to_string(),
            },
            ClientEvent::response_create(),
            ClientEvent::ResponseCreate {
                response: Some(ResponseConfig {
                    modalities: Some(vec![Modality::Text]),
                    max_response_output_tokens: Some(MaxTokens::Infinite(InfiniteTokens::Inf)),
                    ..Default::default()
                }),
            },
            ClientEvent::response_cancel(Some("resp_1".to_string())),
        ];

        for event in events {
            let frame = encode(&event).unwrap();
            let value: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["type"], event.event_type());
            assert_eq!(decode_client(&frame).unwrap(), event);
        }
    }

    #[test]
    fn test_server_events_round_trip() {
        let frames = [
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"bad_event","message":"bad","event_id":"evt_1"}}"#,
            r#"{"type":"session.created","session":{"id":"sess_1","model":"gpt-4o-realtime-preview"}}"#,
            r#"{"type":"session.updated","session":{"id":"sess_1","voice":"nova","modalities":["text","audio"],"input_audio_format":"g711_ulaw","turn_detection":{"type":"server_vad"}}}"#,
            r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":100,"item_id":"item_2"}"#,
            r#"{"type":"input_audio_buffer.speech_stopped","audio_end_ms":900,"item_id":"item_2"}"#,
            r#"{"type":"input_audio_buffer.committed","previous_item_id":"item_1","item_id":"item_2"}"#,
            r#"{"type":"input_audio_buffer.cleared"}"#,
            r#"{"type":"conversation.item.created","item":{"id":"item_1","type":"message","role":"user","content":[{"type":"input_text","text":"Hi"}]}}"#,
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"item_2","content_index":0,"transcript":"hello there"}"#,
            r#"{"type":"conversation.item.input_audio_transcription.failed","item_id":"item_2","content_index":0,"error":{"type":"transcription_error","message":"unreadable"}}"#,
            r#"{"type":"conversation.item.truncated","item_id":"item_1","content_index":0,"audio_end_ms":10}"#,
            r#"{"type":"conversation.item.deleted","item_id":"item_1"}"#,
            r#"{"type":"response.created","response":{"id":"resp_1","status":"in_progress"}}"#,
            r#"{"type":"response.done","response":{"id":"resp_1","status":"cancelled","status_details":{"reason":"client_cancelled"},"output":[{"id":"item_3","type":"message","role":"assistant","content":[{"type":"audio","transcript":"Hel"}]}],"usage":{"total_tokens":42,"input_tokens":30,"output_tokens":12}}}"#,
            r#"{"type":"response.output_item.added","response_id":"resp_1","output_index":0,"item":{"id":"item_fc","type":"function_call","call_id":"call_1","name":"get_weather","arguments":""}}"#,
            r#"{"type":"response.output_item.done","response_id":"resp_1","output_index":0,"item":{"id":"item_fc","type":"function_call","status":"completed","call_id":"call_1","name":"get_weather","arguments":"{}"}}"#,
            r#"{"type":"response.content_part.added","response_id":"resp_1","item_id":"item_3","output_index":0,"content_index":0,"part":{"type":"audio","transcript":""}}"#,
            r#"{"type":"response.content_part.done","response_id":"resp_1","item_id":"item_3","output_index":0,"content_index":0,"part":{"type":"audio","transcript":"Hello"}}"#,
            r#"{"type":"response.text.delta","response_id":"resp_1","item_id":"item_3","delta":"Hel"}"#,
            r#"{"type":"response.text.done","response_id":"resp_1","item_id":"item_3","text":"Hello"}"#,
            r#"{"type":"response.audio_transcript.delta","response_id":"resp_1","item_id":"item_3","delta":"Hel"}"#,
            r#"{"type":"response.audio_transcript.done","response_id":"resp_1","item_id":"item_3","transcript":"Hello"}"#,
            r#"{"type":"response.audio.delta","response_id":"resp_1","item_id":"item_3","delta":"AAEC"}"#,
            r#"{"type":"response.audio.done","response_id":"resp_1","item_id":"item_3","output_index":0,"content_index":0}"#,
            r#"{"type":"response.function_call_arguments.delta","response_id":"resp_1","item_id":"item_fc","call_id":"call_1","delta":"{\"ci"}"#,
            r#"{"type":"response.function_call_arguments.done","call_id":"call_1","name":"get_weather","arguments":"{}"}"#,
            r#"{"type":"response.function_call_arguments.done","response_id":"resp_1","item_id":"item_fc","call_id":"call_2","arguments":"{\"city\":\"Paris\"}"}"#,
            r#"{"type":"rate_limits.updated","rate_limits":[{"name":"requests","limit":100,"remaining":99,"reset_seconds":1.5}]}"#,
            r#"{"type":"response.future_feature","data":[1,2]}"#,
        ];

        let mut covered = std::collections::HashSet::new();
        for frame in frames {
            let event = decode(frame).unwrap();
            let encoded = encode_server(&event).unwrap();
            assert_eq!(decode(&encoded).unwrap(), event, "frame: {frame}");
            covered.insert(event.event_type().to_string());
        }

        for event_type in SERVER_EVENT_TYPES.iter() {
            assert!(
                covered.contains(*event_type),
                "no round-trip frame for {event_type}"
            );
        }
    }

    #[test]
    fn test_known_types_are_dispatched() {
        for event_type in SERVER_EVENT_TYPES.iter() {
            let frame = format!(r#"{{"type":"{event_type}"}}"#);
            // Bare frames may fail shape validation but never decode as Unknown.
            if let Ok(event) = decode(&frame) {
                assert!(!matches!(event, ServerEvent::Unknown { .. }));
                assert_eq!(event.event_type(), *event_type);
            }
        }
    }

    #[test]
    fn test_response_id_of_streamed_events() {
        let delta = decode(
            r#"{"type":"response.audio.delta","response_id":"resp_7","item_id":"item_3","delta":"AAEC"}"#,
        )
        .unwrap();
        assert_eq!(delta.response_id(), Some("resp_7"));

        let done = decode(r#"{"type":"response.done","response":{"id":"resp_7"}}"#).unwrap();
        assert_eq!(done.response_id(), Some("resp_7"));

        let anonymous = decode(r#"{"type":"response.text.delta","delta":"Hi"}"#).unwrap();
        assert_eq!(anonymous.response_id(), None);

        let speech = decode(r#"{"type":"input_audio_buffer.speech_started"}"#).unwrap();
        assert_eq!(speech.response_id(), None);
    }

    #[test]
    fn test_unknown_event_is_not_fatal() {
        let event = decode(r#"{"type":"conversation.item.retrieved","x":1}"#).unwrap();
        match event {
            ServerEvent::Unknown {
                event_type,
                payload,
            } => {
                assert_eq!(event_type, "conversation.item.retrieved");
                assert_eq!(payload["x"], 1);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        assert!(matches!(decode("not json"), Err(RealtimeError::Protocol(_))));
        assert!(matches!(
            decode(r#"{"no_type":true}"#),
            Err(RealtimeError::Protocol(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"response.text.delta"}"#),
            Err(RealtimeError::Protocol(_))
        ));
    }

    #[test]
    fn test_function_call_done_without_name() {
        let event = decode(
            r#"{"type":"response.function_call_arguments.done","call_id":"call_9","arguments":"{\"a\":1}"}"#,
        )
        .unwrap();
        match event {
            ServerEvent::FunctionCallArgumentsDone { name, call_id, .. } => {
                assert_eq!(call_id, "call_9");
                assert!(name.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_item_kind_is_tolerated() {
        let event = decode(
            r#"{"type":"conversation.item.created","item":{"id":"item_x","type":"mcp_call"}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::ConversationItemCreated { item, .. } => {
                assert_eq!(item.kind, ItemKind::Other)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_audio_delta_decode() {
        let original = vec![0u8, 1, 2, 3, 4, 5];
        let encoded = BASE64_STANDARD.encode(&original);
        let decoded = ServerEvent::decode_audio_delta(&encoded).unwrap();
        assert_eq!(decoded, original);
    }
}
