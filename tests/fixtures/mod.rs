//! Test Fixtures Module
//!
//! Programmatically generated audio for WaaV Live tests:
//! - Microphone blocks (f32, 16kHz capture rate)
//! - Agent audio deltas (PCM16 bytes, 24kHz playback rate)
//! - WAV files for the file-backed devices

// Allow dead code in test fixtures - not every test binary uses every helper
#![allow(dead_code)]

pub mod audio_fixtures;

pub use audio_fixtures::*;
