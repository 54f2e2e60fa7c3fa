use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present here
/// override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// agent:
///   api_key: "your-gemini-key"
///   model: "gemini-2.5-flash-native-audio-preview-09-2025"
///   voice: "Zephyr"
///   system_instruction: "You are Dak-Mitra, ..."
///   input_transcription: true
///   output_transcription: true
///
/// audio:
///   capture_sample_rate: 16000
///   playback_sample_rate: 24000
///   frame_samples: 512
///
/// session:
///   send_queue_capacity: 256
///   connect_timeout_seconds: 10
///   teardown_timeout_ms: 2000
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub agent: Option<AgentYaml>,
    pub audio: Option<AudioYaml>,
    pub session: Option<SessionYaml>,
}

/// Agent connection settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentYaml {
    pub api_key: Option<String>,
    /// Override of the Gemini Live WebSocket endpoint
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub input_transcription: Option<bool>,
    pub output_transcription: Option<bool>,
}

/// Audio format settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub capture_sample_rate: Option<u32>,
    pub playback_sample_rate: Option<u32>,
    pub frame_samples: Option<usize>,
}

/// Session lifecycle settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub send_queue_capacity: Option<usize>,
    pub connect_timeout_seconds: Option<u64>,
    pub teardown_timeout_ms: Option<u64>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
