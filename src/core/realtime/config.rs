//! Protocol constants and wire enums for the realtime service.
//!
//! - Endpoint and protocol headers
//! - Audio format and chunking parameters
//! - Response modalities

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default realtime WebSocket endpoint.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Model used when none is configured.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Voice used when none is configured.
pub const DEFAULT_VOICE: &str = "alloy";

/// Protocol version header sent with every connection request.
pub const PROTOCOL_VERSION_HEADER: (&str, &str) = ("OpenAI-Beta", "realtime=v1");

/// Sample rate of pcm16 audio on the wire.
pub const REALTIME_SAMPLE_RATE: u32 = 24000;

/// Sample rate of G.711 audio on the wire.
pub const G711_SAMPLE_RATE: u32 = 8000;

/// Size of each outbound `input_audio_buffer.append` chunk in bytes.
pub const AUDIO_CHUNK_SIZE: usize = 4096;

/// Interval between liveness probes while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Time a liveness probe may take before the connection is considered lost.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Audio Formats
// =============================================================================

/// Audio encodings accepted for input and produced for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioFormat {
    /// 16-bit signed little-endian PCM
    #[default]
    #[serde(rename = "pcm16")]
    Pcm16,
    /// G.711 μ-law
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    /// G.711 A-law
    #[serde(rename = "g711_alaw")]
    G711Alaw,
}

impl AudioFormat {
    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm16 => "pcm16",
            Self::G711Ulaw => "g711_ulaw",
            Self::G711Alaw => "g711_alaw",
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Pcm16 => REALTIME_SAMPLE_RATE,
            Self::G711Ulaw | Self::G711Alaw => G711_SAMPLE_RATE,
        }
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Pcm16 => 2,
            Self::G711Ulaw | Self::G711Alaw => 1,
        }
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    /// Accepts the API names and the short `ulaw`/`mulaw`/`alaw` aliases,
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pcm16" | "pcm" => Ok(Self::Pcm16),
            "g711_ulaw" | "ulaw" | "mulaw" => Ok(Self::G711Ulaw),
            "g711_alaw" | "alaw" => Ok(Self::G711Alaw),
            _ => Err(format!("unsupported audio format: {s}")),
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Modalities
// =============================================================================

/// Response modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

impl Modality {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_format_parsing() {
        assert_eq!("pcm16".parse::<AudioFormat>(), Ok(AudioFormat::Pcm16));
        assert_eq!("G711_ULAW".parse::<AudioFormat>(), Ok(AudioFormat::G711Ulaw));
        assert_eq!(" alaw ".parse::<AudioFormat>(), Ok(AudioFormat::G711Alaw));
        assert!("flac".parse::<AudioFormat>().is_err());
        assert!("".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn test_audio_format_properties() {
        assert_eq!(AudioFormat::Pcm16.sample_rate(), 24000);
        assert_eq!(AudioFormat::G711Alaw.sample_rate(), 8000);
        assert_eq!(AudioFormat::Pcm16.bytes_per_sample(), 2);
        assert_eq!(
            serde_json::to_string(&AudioFormat::G711Ulaw).unwrap(),
            "\"g711_ulaw\""
        );
    }

    #[test]
    fn test_modality_serialization() {
        let json = serde_json::to_string(&vec![Modality::Text, Modality::Audio]).unwrap();
        assert_eq!(json, r#"["text","audio"]"#);
    }
}
