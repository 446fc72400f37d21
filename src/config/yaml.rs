use serde::Deserialize;
use std::path::Path;

use super::ConfigError;

/// Complete YAML configuration structure
///
/// All fields are optional so a file can override only what it needs; anything
/// left out falls back to the environment and then to defaults.
///
/// # Example YAML structure
/// ```yaml
/// realtime:
///   api_key: "sk-..."
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview"
///   voice: "nova"
///   instructions: "You are a helpful assistant."
///   temperature: 0.8
///   transcription_model: "whisper-1"
///
/// audio:
///   input_format: "pcm16"
///   output_format: "pcm16"
///
/// turn_detection:
///   mode: "server_vad"
///
/// reconnection:
///   enabled: true
///   max_attempts: 5
///   initial_delay_ms: 1000
///   max_delay_ms: 30000
///   heartbeat_interval_seconds: 30
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub realtime: Option<RealtimeYaml>,
    pub audio: Option<AudioYaml>,
    pub turn_detection: Option<TurnDetectionYaml>,
    pub reconnection: Option<ReconnectionYaml>,
}

/// Service endpoint and session defaults from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    /// Enables user speech transcription with this model
    pub transcription_model: Option<String>,
}

/// Audio formats from YAML (`pcm16`, `g711_ulaw`, `g711_alaw`)
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub input_format: Option<String>,
    pub output_format: Option<String>,
}

/// Turn detection from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TurnDetectionYaml {
    /// `server_vad`, `semantic_vad` or `none`
    pub mode: Option<String>,
}

/// Reconnection policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub heartbeat_interval_seconds: Option<u64>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Read(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML config: {e}")))
    }
}
