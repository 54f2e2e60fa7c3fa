//! Duplex channel to the remote conversational agent.
//!
//! # Supported Providers
//!
//! - **Gemini Live** - Google's native-audio Live API over WebSocket
//! - **Loopback** - In-process channel driven by a [`LoopbackController`]
//!
//! # Architecture
//!
//! - `BaseTransport` trait for provider abstraction
//! - `TransportFactory` so a session can create one fresh transport per start
//! - Ordered [`EventStream`] of [`InboundEvent`]s instead of callbacks
//!
//! # Example
//!
//! ```rust,ignore
//! use waav_live::core::transport::{create_transport_factory, TransportProvider};
//!
//! let factory = create_transport_factory(TransportProvider::Gemini, api_key, None)?;
//! let mut transport = factory.create()?;
//! transport.open(TransportConfig::default()).await?;
//! ```

mod base;
pub mod gemini;
mod loopback;

pub use base::{
    BaseTransport, BoxedTransport, ChunkSender, ConnectionState, DEFAULT_SEND_QUEUE_CAPACITY,
    EventStream, InboundEvent, SendOutcome, Speaker, TransportConfig, TransportError,
    TransportFactory, TransportResult,
};
pub use gemini::{GEMINI_LIVE_URL, GeminiLive, GeminiLiveFactory, GeminiLiveModel, GeminiLiveVoice};
pub use loopback::{LoopbackController, LoopbackFactory, LoopbackTransport};

use std::sync::Arc;

/// Supported transport providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProvider {
    /// Gemini Live API
    Gemini,
    /// In-process loopback
    Loopback,
}

impl TransportProvider {
    /// Parse provider from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gemini" | "gemini-live" | "gemini_live" | "google" => Some(TransportProvider::Gemini),
            "loopback" => Some(TransportProvider::Loopback),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportProvider::Gemini => write!(f, "gemini"),
            TransportProvider::Loopback => write!(f, "loopback"),
        }
    }
}

/// Build a transport factory for a network provider.
///
/// Loopback factories come from [`LoopbackController::factory`] instead,
/// since the caller needs the controller to drive them.
pub fn create_transport_factory(
    provider: TransportProvider,
    api_key: Option<String>,
    endpoint: Option<String>,
) -> TransportResult<Arc<dyn TransportFactory>> {
    match provider {
        TransportProvider::Gemini => {
            let api_key = api_key
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    TransportError::AuthenticationFailed(
                        "GEMINI_API_KEY is required for the Gemini transport".to_string(),
                    )
                })?;
            let mut factory = GeminiLiveFactory::new(api_key);
            if let Some(endpoint) = endpoint {
                factory = factory.with_endpoint(endpoint);
            }
            // Surface a bad endpoint now rather than on first start
            factory.create()?;
            Ok(Arc::new(factory))
        }
        TransportProvider::Loopback => Err(TransportError::InvalidConfiguration(
            "loopback transports are created from a LoopbackController".to_string(),
        )),
    }
}

/// Get list of supported transport providers.
pub fn get_supported_transport_providers() -> Vec<&'static str> {
    vec!["gemini", "loopback"]
}
