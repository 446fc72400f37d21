//! Configuration for the realtime client binary.
//!
//! Values come from .env files, environment variables and an optional YAML
//! file. Priority: YAML > ENV vars > .env values > defaults. The `.env` file
//! itself is loaded by `main.rs` at startup.
//!
//! # Example
//! ```rust,no_run
//! use waav_realtime::config::ClientConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Environment only
//! let config = ClientConfig::from_env()?;
//!
//! // YAML file with environment fallbacks
//! let config = ClientConfig::from_file(&PathBuf::from("realtime.yaml"))?;
//! let session_config = config.realtime_config();
//! # Ok(())
//! # }
//! ```

use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::core::realtime::{
    AudioFormat, RealtimeConfig, ReconnectionConfig, SessionConfiguration, TransportConfig,
    TurnDetectionConfig,
};
use crate::core::realtime::config::{
    DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_URL, DEFAULT_VOICE, HEARTBEAT_INTERVAL,
};

mod yaml;

pub use yaml::YamlConfig;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Read(String),

    #[error("{0}")]
    Parse(String),

    #[error("Missing API key: set OPENAI_API_KEY or realtime.api_key")]
    MissingApiKey,

    #[error("Invalid realtime URL '{0}': expected a ws:// or wss:// address")]
    InvalidUrl(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Client configuration
///
/// Everything needed to open a realtime session from the command line.
#[derive(Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub url: String,
    pub model: String,
    pub voice: String,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    /// Enables user speech transcription when set
    pub transcription_model: Option<String>,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub turn_detection: TurnDetectionConfig,
    pub reconnection: ReconnectionConfig,
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instructions: None,
            temperature: None,
            transcription_model: None,
            input_audio_format: AudioFormat::default(),
            output_audio_format: AudioFormat::default(),
            turn_detection: TurnDetectionConfig::default(),
            reconnection: ReconnectionConfig::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl Drop for ClientConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        self.api_key.zeroize();
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &redact(&self.api_key))
            .field("url", &self.url)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("instructions", &self.instructions)
            .field("temperature", &self.temperature)
            .field("transcription_model", &self.transcription_model)
            .field("input_audio_format", &self.input_audio_format)
            .field("output_audio_format", &self.output_audio_format)
            .field("turn_detection", &self.turn_detection)
            .field("reconnection", &self.reconnection)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        "<unset>".to_string()
    } else {
        "[REDACTED]".to_string()
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Fails on unparseable values or when validation rejects the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::load(None)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, falling back to the environment
    /// for anything the file leaves out.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        let config = Self::load(Some(yaml))?;
        config.validate()?;
        Ok(config)
    }

    fn load(yaml: Option<YamlConfig>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Environment first
        if let Some(key) = env_var("OPENAI_API_KEY") {
            config.api_key = key;
        }
        if let Some(url) = env_var("REALTIME_URL") {
            config.url = url;
        }
        if let Some(model) = env_var("REALTIME_MODEL") {
            config.model = model;
        }
        if let Some(voice) = env_var("REALTIME_VOICE") {
            config.voice = voice;
        }
        config.instructions = env_var("REALTIME_INSTRUCTIONS");
        config.transcription_model = env_var("REALTIME_TRANSCRIPTION_MODEL");
        if let Some(format) = env_var("REALTIME_INPUT_AUDIO_FORMAT") {
            config.input_audio_format = parse_audio_format("input_audio_format", &format)?;
        }
        if let Some(format) = env_var("REALTIME_OUTPUT_AUDIO_FORMAT") {
            config.output_audio_format = parse_audio_format("output_audio_format", &format)?;
        }
        if let Some(mode) = env_var("REALTIME_TURN_DETECTION") {
            config.turn_detection = parse_turn_detection(&mode)?;
        }
        if let Some(attempts) = env_var("REALTIME_MAX_RECONNECT_ATTEMPTS") {
            config.reconnection.max_attempts =
                attempts.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "REALTIME_MAX_RECONNECT_ATTEMPTS",
                    value: attempts.clone(),
                })?;
        }

        // YAML overrides
        let Some(yaml) = yaml else {
            return Ok(config);
        };

        if let Some(realtime) = yaml.realtime {
            if let Some(key) = realtime.api_key {
                config.api_key = key;
            }
            if let Some(url) = realtime.url {
                config.url = url;
            }
            if let Some(model) = realtime.model {
                config.model = model;
            }
            if let Some(voice) = realtime.voice {
                config.voice = voice;
            }
            if realtime.instructions.is_some() {
                config.instructions = realtime.instructions;
            }
            if realtime.temperature.is_some() {
                config.temperature = realtime.temperature;
            }
            if realtime.transcription_model.is_some() {
                config.transcription_model = realtime.transcription_model;
            }
        }

        if let Some(audio) = yaml.audio {
            if let Some(format) = audio.input_format {
                config.input_audio_format = parse_audio_format("input_audio_format", &format)?;
            }
            if let Some(format) = audio.output_format {
                config.output_audio_format = parse_audio_format("output_audio_format", &format)?;
            }
        }

        if let Some(mode) = yaml.turn_detection.and_then(|t| t.mode) {
            config.turn_detection = parse_turn_detection(&mode)?;
        }

        if let Some(reconnection) = yaml.reconnection {
            if let Some(enabled) = reconnection.enabled {
                config.reconnection.enabled = enabled;
            }
            if let Some(max_attempts) = reconnection.max_attempts {
                config.reconnection.max_attempts = max_attempts;
            }
            if let Some(delay) = reconnection.initial_delay_ms {
                config.reconnection.initial_delay_ms = delay;
            }
            if let Some(delay) = reconnection.max_delay_ms {
                config.reconnection.max_delay_ms = delay;
            }
            if let Some(seconds) = reconnection.heartbeat_interval_seconds {
                config.heartbeat_interval = Duration::from_secs(seconds);
            }
        }

        Ok(config)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "heartbeat_interval_seconds",
                value: "0".to_string(),
            });
        }
        self.session_configuration()
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                name: "session",
                value: e.to_string(),
            })
    }

    pub fn session_configuration(&self) -> SessionConfiguration {
        SessionConfiguration {
            model: self.model.clone(),
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            turn_detection: self.turn_detection.clone(),
            input_audio_format: self.input_audio_format,
            output_audio_format: self.output_audio_format,
            input_audio_transcription: self.transcription_model.clone(),
            temperature: self.temperature,
            ..Default::default()
        }
    }

    /// Build the session client configuration.
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            api_key: self.api_key.clone(),
            url: self.url.clone(),
            session: self.session_configuration(),
            transport: TransportConfig {
                reconnection: self.reconnection.clone(),
                heartbeat_interval: self.heartbeat_interval,
                ..Default::default()
            },
            extra_headers: Vec::new(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_audio_format(name: &'static str, value: &str) -> Result<AudioFormat, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

fn parse_turn_detection(mode: &str) -> Result<TurnDetectionConfig, ConfigError> {
    match mode.trim().to_lowercase().as_str() {
        "server_vad" | "server" => Ok(TurnDetectionConfig::default()),
        "semantic_vad" | "semantic" => Ok(TurnDetectionConfig::SemanticVad {
            eagerness: None,
            create_response: true,
        }),
        "none" | "manual" => Ok(TurnDetectionConfig::None),
        _ => Err(ConfigError::InvalidValue {
            name: "turn_detection",
            value: mode.to_string(),
        }),
    }
}
