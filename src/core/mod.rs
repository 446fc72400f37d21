pub mod realtime;

// Re-export commonly used types for convenience
pub use realtime::{
    ConversationState, RealtimeConfig, RealtimeError, RealtimeResult, RealtimeSession,
    SessionConfiguration,
};
