//! Configuration module for WaaV Live
//!
//! This module handles session configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//!
//! # Example
//! ```rust,no_run
//! use waav_live::config::LiveConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = LiveConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("live.yaml");
//! let config = LiveConfig::from_file(&config_path)?;
//!
//! println!("Agent model: {}", config.model);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod env;
mod yaml;

pub use yaml::{AgentYaml, AudioYaml, SessionYaml, YamlConfig};

use crate::core::capture::{CaptureConfig, DEFAULT_FRAME_SAMPLES};
use crate::core::codec::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::core::session::SessionConfig;
use crate::core::transport::gemini::DEFAULT_SYSTEM_INSTRUCTION;
use crate::core::transport::{
    DEFAULT_SEND_QUEUE_CAPACITY, GeminiLiveModel, GeminiLiveVoice, TransportConfig,
    TransportFactory, TransportProvider, TransportResult, create_transport_factory,
};

/// Live session configuration
///
/// Contains everything needed to run a voice session against Gemini Live:
/// - Agent settings (API key, endpoint, model, voice, instruction)
/// - Audio formats (capture/playback rates, frame size)
/// - Session lifecycle bounds (send queue, connect and teardown timeouts)
#[derive(Debug, Clone)]
pub struct LiveConfig {
    // Agent settings
    pub api_key: Option<String>,
    /// Endpoint override; `None` uses the public Gemini Live URL
    pub url: Option<String>,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,

    // Audio settings
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    /// Samples per outbound frame
    pub frame_samples: usize,

    // Session settings
    pub send_queue_capacity: usize,
    pub connect_timeout_seconds: u64,
    pub teardown_timeout_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: None,
            model: GeminiLiveModel::default().as_str().to_string(),
            voice: GeminiLiveVoice::default().as_str().to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_transcription: true,
            output_transcription: true,
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            connect_timeout_seconds: 10,
            teardown_timeout_ms: 2000,
        }
    }
}

impl Drop for LiveConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.api_key {
            key.zeroize();
        }
    }
}

impl LiveConfig {
    /// Load configuration from environment variables over defaults
    ///
    /// The .env file is loaded by the binary at startup, so its values are
    /// visible here as ordinary environment variables.
    ///
    /// # Errors
    /// Returns an error if a variable has an invalid format or validation fails.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = env::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = YamlConfig::from_file(path)?;

        let mut config = env::load_from_env()?;
        config.apply_yaml(yaml_config);
        config.validate()?;

        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) {
        if let Some(agent) = yaml.agent {
            if agent.api_key.is_some() {
                self.api_key = agent.api_key;
            }
            if agent.url.is_some() {
                self.url = agent.url;
            }
            if let Some(model) = agent.model {
                self.model = model;
            }
            if let Some(voice) = agent.voice {
                self.voice = voice;
            }
            if let Some(instruction) = agent.system_instruction {
                self.system_instruction = instruction;
            }
            if let Some(flag) = agent.input_transcription {
                self.input_transcription = flag;
            }
            if let Some(flag) = agent.output_transcription {
                self.output_transcription = flag;
            }
        }

        if let Some(audio) = yaml.audio {
            if let Some(rate) = audio.capture_sample_rate {
                self.capture_sample_rate = rate;
            }
            if let Some(rate) = audio.playback_sample_rate {
                self.playback_sample_rate = rate;
            }
            if let Some(samples) = audio.frame_samples {
                self.frame_samples = samples;
            }
        }

        if let Some(session) = yaml.session {
            if let Some(capacity) = session.send_queue_capacity {
                self.send_queue_capacity = capacity;
            }
            if let Some(seconds) = session.connect_timeout_seconds {
                self.connect_timeout_seconds = seconds;
            }
            if let Some(ms) = session.teardown_timeout_ms {
                self.teardown_timeout_ms = ms;
            }
        }
    }

    /// Reject values that would make a session unusable
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.capture_sample_rate == 0 {
            return Err("Capture sample rate must be greater than zero".into());
        }
        if self.playback_sample_rate == 0 {
            return Err("Playback sample rate must be greater than zero".into());
        }
        if self.frame_samples == 0 {
            return Err("Capture frame size must be greater than zero".into());
        }
        if self.send_queue_capacity == 0 {
            return Err("Send queue capacity must be greater than zero".into());
        }
        if self.connect_timeout_seconds == 0 {
            return Err("Connect timeout must be greater than zero".into());
        }
        if self.teardown_timeout_ms == 0 {
            return Err("Teardown timeout must be greater than zero".into());
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Agent settings sent when the channel opens
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            model: self.model.clone(),
            voice: Some(self.voice.clone()),
            system_instruction: Some(self.system_instruction.clone()),
            input_transcription: self.input_transcription,
            output_transcription: self.output_transcription,
            input_sample_rate: self.capture_sample_rate,
            output_sample_rate: self.playback_sample_rate,
            send_queue_capacity: self.send_queue_capacity,
        }
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            transport: self.to_transport_config(),
            capture: CaptureConfig {
                sample_rate: self.capture_sample_rate,
                frame_samples: self.frame_samples,
            },
            playback_sample_rate: self.playback_sample_rate,
            connect_timeout: self.connect_timeout(),
            teardown_timeout: self.teardown_timeout(),
        }
    }

    /// Gemini Live transport factory for this configuration
    ///
    /// Fails with `AuthenticationFailed` if no API key is configured.
    pub fn transport_factory(&self) -> TransportResult<Arc<dyn TransportFactory>> {
        create_transport_factory(
            TransportProvider::Gemini,
            self.api_key.clone(),
            self.url.clone(),
        )
    }
}
