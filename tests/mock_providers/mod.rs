//! Mock Provider Servers
//!
//! Simulates the agent side of a live voice channel:
//! - WebSocket (Gemini Live `BidiGenerateContent`)
//!
//! Tests script the server by pushing frames to the current connection and
//! inspect what the client sent.

// Allow dead code in test infrastructure - not every test binary uses every helper
#![allow(dead_code)]

pub mod gemini_mock;

pub use gemini_mock::*;
