//! Gemini Live WebSocket message types.
//!
//! All messages are JSON objects keyed by their kind. The server may deliver
//! them in text or binary frames.
//!
//! # Protocol Overview
//!
//! Client messages (sent to server):
//! - setup - First message; selects model, voice, instruction, transcripts
//! - realtimeInput - Streamed microphone audio
//!
//! Server messages (received from server):
//! - setupComplete - Session is ready for audio
//! - serverContent - Model audio, transcripts, turn boundaries, interruption
//! - goAway - Server will disconnect soon
//! - toolCall / usageMetadata - Ignored here

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::codec::EncodedChunk;
use crate::core::transport::base::{InboundEvent, Speaker};

// =============================================================================
// Shared Types
// =============================================================================

/// Inline binary payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    /// MIME type, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Base64-encoded data
    pub data: String,
}

/// One part of a content message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Content message made of parts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Content {
    /// Single text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
            role: None,
        }
    }
}

// =============================================================================
// Client Messages (sent to server)
// =============================================================================

/// Prebuilt voice selection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

/// Generation settings for the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Response modalities; always `["AUDIO"]` for voice sessions
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// Presence enables transcription for that direction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioTranscriptionConfig {}

/// Body of the `setup` message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    /// Model resource name, `models/<id>`
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

/// Streamed realtime input.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
}

/// Client messages sent to the Gemini Live API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Session setup, must be the first message
    Setup(SetupConfig),
    /// Realtime microphone audio
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Wrap an encoded microphone chunk.
    pub fn audio(chunk: &EncodedChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                mime_type: chunk.mime_type.clone(),
                data: chunk.to_base64(),
            }),
        })
    }
}

// =============================================================================
// Server Messages (received from server)
// =============================================================================

/// Transcript fragment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

/// Model output and turn signals.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub generation_complete: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

/// Advance notice of server disconnect.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Server messages received from the Gemini Live API.
///
/// Exactly one field is normally present per message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub tool_call: Option<serde_json::Value>,
    #[serde(default)]
    pub usage_metadata: Option<serde_json::Value>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

impl ServerContent {
    /// Translate into inbound events, in the order the router must apply
    /// them: interruption, user transcript, agent transcript, audio, and
    /// finally the turn boundary.
    pub fn into_events(self) -> Vec<InboundEvent> {
        let mut events = Vec::new();

        if self.interrupted {
            events.push(InboundEvent::Interrupted);
        }

        if let Some(text) = self.input_transcription.and_then(|t| t.text)
            && !text.is_empty()
        {
            events.push(InboundEvent::TranscriptDelta {
                speaker: Speaker::User,
                text,
            });
        }

        if let Some(text) = self.output_transcription.and_then(|t| t.text)
            && !text.is_empty()
        {
            events.push(InboundEvent::TranscriptDelta {
                speaker: Speaker::Agent,
                text,
            });
        }

        if let Some(turn) = self.model_turn {
            for blob in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                if !blob.mime_type.starts_with("audio/") {
                    tracing::trace!("Skipping non-audio inline data: {}", blob.mime_type);
                    continue;
                }
                match BASE64_STANDARD.decode(&blob.data) {
                    Ok(bytes) => events.push(InboundEvent::AudioDelta(Bytes::from(bytes))),
                    Err(e) => tracing::warn!("Failed to decode audio part: {}", e),
                }
            }
        }

        if self.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }

        events
    }
}

// =============================================================================
// Tests
// =============================================================================
