//! Gemini Live API module.
//!
//! This module provides duplex voice streaming using Google's Gemini Live
//! `BidiGenerateContent` WebSocket API.
//!
//! # Features
//!
//! - Bidirectional audio streaming
//! - Input (user) and output (agent) speech transcription
//! - Server-side barge-in detection (`interrupted`)
//! - Prebuilt voice selection
//!
//! # Supported Voices
//!
//! Puck, Charon, Kore, Fenrir, Aoede, Leda, Orus, Zephyr
//!
//! # Audio Format
//!
//! Input audio is PCM 16-bit signed little-endian at 16kHz; output audio is
//! PCM 16-bit signed little-endian at 24kHz.

mod client;
mod config;
mod messages;

pub use client::{GeminiLive, GeminiLiveFactory};
pub use config::{
    DEFAULT_SYSTEM_INSTRUCTION, GEMINI_LIVE_INPUT_SAMPLE_RATE, GEMINI_LIVE_OUTPUT_SAMPLE_RATE,
    GEMINI_LIVE_URL, GeminiLiveModel, GeminiLiveVoice,
};
pub use messages::{ClientMessage, ServerContent, ServerMessage};
