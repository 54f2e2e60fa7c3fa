//! Gemini Live API configuration types.
//!
//! This module contains configuration types for the Gemini Live API:
//! - Model selection
//! - Voice selection
//! - Endpoint and sample rate constants

use serde::{Deserialize, Serialize};

/// Gemini Live `BidiGenerateContent` WebSocket endpoint.
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Sample rate Gemini Live expects for microphone audio.
pub const GEMINI_LIVE_INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of Gemini Live speech output.
pub const GEMINI_LIVE_OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Default system instruction for the India Post voice assistant.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Dak-Mitra, the India Post official voice assistant. Help citizens with tracking, grievances, and postal rules. Be professional and helpful.";

// =============================================================================
// Models
// =============================================================================

/// Supported Gemini Live models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GeminiLiveModel {
    /// Native audio preview (September 2025)
    #[default]
    #[serde(rename = "gemini-2.5-flash-native-audio-preview-09-2025")]
    Flash25NativeAudioPreview092025,
    /// Half-cascade live preview
    #[serde(rename = "gemini-live-2.5-flash-preview")]
    Live25FlashPreview,
    /// Gemini 2.0 Flash Live
    #[serde(rename = "gemini-2.0-flash-live-001")]
    Flash20Live001,
}

impl GeminiLiveModel {
    /// Convert to the API model identifier.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flash25NativeAudioPreview092025 => "gemini-2.5-flash-native-audio-preview-09-2025",
            Self::Live25FlashPreview => "gemini-live-2.5-flash-preview",
            Self::Flash20Live001 => "gemini-2.0-flash-live-001",
        }
    }

    /// Resource name used in the setup message.
    pub fn resource_name(&self) -> String {
        format!("models/{}", self.as_str())
    }

    /// Parse from string, with fallback to default. Accepts an optional
    /// `models/` prefix.
    pub fn from_str_or_default(s: &str) -> Self {
        let lowered = s.to_lowercase();
        match lowered.trim_start_matches("models/") {
            "gemini-2.5-flash-native-audio-preview-09-2025" => Self::Flash25NativeAudioPreview092025,
            "gemini-live-2.5-flash-preview" => Self::Live25FlashPreview,
            "gemini-2.0-flash-live-001" => Self::Flash20Live001,
            _ => Self::default(),
        }
    }
}

impl std::fmt::Display for GeminiLiveModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Voices
// =============================================================================

/// Prebuilt voices available for Gemini Live speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GeminiLiveVoice {
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
    Leda,
    Orus,
    /// Zephyr voice (default)
    #[default]
    Zephyr,
}

impl GeminiLiveVoice {
    /// Convert to the API voice name.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Puck => "Puck",
            Self::Charon => "Charon",
            Self::Kore => "Kore",
            Self::Fenrir => "Fenrir",
            Self::Aoede => "Aoede",
            Self::Leda => "Leda",
            Self::Orus => "Orus",
            Self::Zephyr => "Zephyr",
        }
    }

    /// Parse from string (case-insensitive), with fallback to default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "puck" => Self::Puck,
            "charon" => Self::Charon,
            "kore" => Self::Kore,
            "fenrir" => Self::Fenrir,
            "aoede" => Self::Aoede,
            "leda" => Self::Leda,
            "orus" => Self::Orus,
            "zephyr" => Self::Zephyr,
            _ => Self::default(),
        }
    }

    /// Get all available voices.
    pub fn all() -> &'static [GeminiLiveVoice] {
        &[
            Self::Puck,
            Self::Charon,
            Self::Kore,
            Self::Fenrir,
            Self::Aoede,
            Self::Leda,
            Self::Orus,
            Self::Zephyr,
        ]
    }
}

impl std::fmt::Display for GeminiLiveVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
