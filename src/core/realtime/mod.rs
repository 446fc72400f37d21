//! Realtime conversational session client.
//!
//! A [`RealtimeSession`] keeps one bidirectional event-stream connection to a
//! realtime speech/text model service and turns its events into a local
//! conversation, a conversation state machine and a handful of notification
//! feeds.
//!
//! # Layers
//!
//! - [`transport`]: connection lifecycle, liveness probing, heartbeat and
//!   reconnection with exponential backoff
//! - [`messages`]: wire codec for client and server events
//! - [`audio`]: fixed-size chunking of outbound audio and input level metering
//! - [`tools`]: execution of server-requested function calls
//! - [`conversation`]: ordered, de-duplicated conversation items
//! - [`session`]: the controller tying everything together
//!
//! # Example
//!
//! ```rust,ignore
//! use waav_realtime::core::realtime::{RealtimeConfig, RealtimeSession};
//!
//! let session = RealtimeSession::new(RealtimeConfig::new("sk-..."));
//! let mut transcripts = session.subscribe_transcripts();
//! session.start().await?;
//! session.send_text("Hello").await?;
//! while let Some(t) = transcripts.recv().await {
//!     if t.is_final {
//!         println!("[{}] {}", t.role, t.text);
//!     }
//! }
//! ```

pub mod audio;
mod base;
pub mod config;
pub mod conversation;
pub mod feed;
pub mod messages;
pub mod session;
pub mod tools;
pub mod transport;

pub use audio::{AudioBufferManager, AudioFlush, audio_level};
pub use base::{
    ClientEventSink, ConnectionState, ConversationState, FunctionCallRequest, RealtimeAudioData,
    RealtimeConfig, RealtimeError, RealtimeResult, ReconnectionConfig, SessionConfiguration,
    StateChange, ToolDefinition, TranscriptResult, TranscriptRole, TurnDetectionConfig,
};
pub use config::{AudioFormat, Modality};
pub use conversation::Conversation;
pub use feed::{Feed, FeedSubscription};
pub use messages::{ClientEvent, ConversationItem, ItemKind, ItemRole, ServerEvent};
pub use session::RealtimeSession;
pub use tools::{ToolBridge, ToolExecutor};
pub use transport::{Transport, TransportConfig, TransportEvent};
