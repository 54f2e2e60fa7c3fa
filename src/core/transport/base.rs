//! Base traits and types for the duplex agent channel.
//!
//! A transport carries encoded microphone audio to the remote agent and
//! yields an ordered stream of [`InboundEvent`]s back. One transport instance
//! serves exactly one connection; the session creates a fresh one per start
//! through a [`TransportFactory`].
//!
//! # Audio Format
//!
//! Outbound chunks are PCM 16-bit little-endian at the capture rate. Inbound
//! audio deltas are raw PCM 16-bit little-endian at the playback rate.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::codec::{self, CAPTURE_SAMPLE_RATE, EncodedChunk, PLAYBACK_SAMPLE_RATE};

/// Default capacity of the outbound audio queue.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur on the agent channel.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection to the agent failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Agent-reported error
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// `events()` was already called for this connection
    #[error("Event stream already taken for this connection")]
    EventStreamTaken,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Session-level configuration sent when the channel opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Agent model identifier (empty selects the provider default)
    #[serde(default)]
    pub model: String,

    /// Synthetic voice for agent speech
    #[serde(default)]
    pub voice: Option<String>,

    /// System instruction for the agent
    #[serde(default)]
    pub system_instruction: Option<String>,

    /// Request transcripts of the user's speech
    pub input_transcription: bool,

    /// Request transcripts of the agent's speech
    pub output_transcription: bool,

    /// Sample rate of outbound (microphone) audio
    pub input_sample_rate: u32,

    /// Sample rate of inbound (agent) audio
    pub output_sample_rate: u32,

    /// Bound of the outbound audio queue
    pub send_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            voice: None,
            system_instruction: None,
            input_transcription: true,
            output_transcription: true,
            input_sample_rate: CAPTURE_SAMPLE_RATE,
            output_sample_rate: PLAYBACK_SAMPLE_RATE,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

impl TransportConfig {
    /// MIME tag declared for outbound audio.
    pub fn input_mime_type(&self) -> String {
        codec::pcm_mime_type(self.input_sample_rate)
    }

    /// MIME tag expected for inbound audio.
    pub fn output_mime_type(&self) -> String {
        codec::pcm_mime_type(self.output_sample_rate)
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Handshake or setup in progress
    Connecting,
    /// Channel ready for audio
    Connected,
    /// Closed locally or by the agent
    Closed,
    /// Connection failed
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Inbound Events
// =============================================================================

/// Who produced a piece of transcript text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The person at the microphone
    User,
    /// The remote agent
    Agent,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Agent => write!(f, "agent"),
        }
    }
}

/// Tagged event received from the agent, consumed exactly once by the
/// session's event router.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Raw PCM 16-bit little-endian audio at the playback rate
    AudioDelta(Bytes),
    /// Incremental transcript text
    TranscriptDelta { speaker: Speaker, text: String },
    /// The agent finished its turn
    TurnComplete,
    /// The user barged in; the agent's in-flight turn is void
    Interrupted,
    /// The channel failed
    Error(String),
    /// The channel closed
    Closed,
}

impl InboundEvent {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::AudioDelta(_) => "audio_delta",
            InboundEvent::TranscriptDelta { .. } => "transcript_delta",
            InboundEvent::TurnComplete => "turn_complete",
            InboundEvent::Interrupted => "interrupted",
            InboundEvent::Error(_) => "error",
            InboundEvent::Closed => "closed",
        }
    }
}

/// Ordered sequence of inbound events for one connection.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<InboundEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::UnboundedReceiver<InboundEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = InboundEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

// =============================================================================
// Outbound Queue
// =============================================================================

/// Result of a fire-and-forget send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Chunk queued for transmission
    Queued,
    /// Queue full; chunk discarded
    QueueFull,
    /// Transport closed or never opened; chunk discarded
    Closed,
}

/// Cloneable, non-blocking handle onto a transport's outbound audio queue.
///
/// Safe to call from capture code: it never awaits. Once the owning transport
/// closes, every send is a silent no-op.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: Option<mpsc::Sender<EncodedChunk>>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl ChunkSender {
    pub fn new(tx: mpsc::Sender<EncodedChunk>) -> Self {
        Self {
            tx: Some(tx),
            closed: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sender with no queue behind it.
    pub fn detached() -> Self {
        Self {
            tx: None,
            closed: Arc::new(AtomicBool::new(true)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn send(&self, chunk: EncodedChunk) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        let Some(tx) = self.tx.as_ref() else {
            return SendOutcome::Closed;
        };
        match tx.try_send(chunk) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::warn!("Outbound audio queue full, {} chunk(s) dropped so far", dropped);
                }
                SendOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Stop accepting chunks on this sender and all of its clones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Chunks discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Base Trait
// =============================================================================

/// Base trait for duplex agent channels.
///
/// # Example
///
/// ```rust,ignore
/// use waav_live::core::transport::{BaseTransport, GeminiLive, TransportConfig};
///
/// let mut transport = GeminiLive::new("api-key".to_string())?;
/// transport.open(TransportConfig::default()).await?;
/// let mut events = transport.events()?;
///
/// transport.send(chunk);
/// while let Some(event) = events.recv().await {
///     println!("{}", event.kind());
/// }
/// transport.close().await?;
/// ```
#[async_trait]
pub trait BaseTransport: Send + Sync {
    /// Establish the channel. Resolves once the agent reports it is ready.
    async fn open(&mut self, config: TransportConfig) -> TransportResult<()>;

    /// Handle onto the outbound queue. Detached before `open`.
    fn sender(&self) -> ChunkSender;

    /// Queue an encoded chunk for transmission. Never blocks; after `close`
    /// this is a no-op.
    fn send(&self, chunk: EncodedChunk) -> SendOutcome {
        self.sender().send(chunk)
    }

    /// Take the inbound event stream for the current connection.
    fn events(&mut self) -> TransportResult<EventStream>;

    /// Tear down the channel.
    async fn close(&mut self) -> TransportResult<()>;

    /// Check if the channel is open and ready.
    fn is_ready(&self) -> bool;

    /// Get the current connection state.
    fn get_connection_state(&self) -> ConnectionState;

    /// Get provider information.
    fn get_provider_info(&self) -> serde_json::Value;
}

/// Boxed trait object for transports.
pub type BoxedTransport = Box<dyn BaseTransport>;

/// Creates one fresh transport per session start.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> TransportResult<BoxedTransport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn chunk() -> EncodedChunk {
        EncodedChunk {
            data: Bytes::from_static(&[0, 0]),
            mime_type: "audio/pcm;rate=16000".to_string(),
        }
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionState::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_speaker_display() {
        assert_eq!(Speaker::User.to_string(), "user");
        assert_eq!(Speaker::Agent.to_string(), "agent");
    }

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert!(config.model.is_empty());
        assert!(config.input_transcription);
        assert!(config.output_transcription);
        assert_eq!(config.input_mime_type(), "audio/pcm;rate=16000");
        assert_eq!(config.output_mime_type(), "audio/pcm;rate=24000");
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));
        assert_eq!(TransportError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_sender_after_close_is_noop() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = ChunkSender::new(tx);
        let clone = sender.clone();

        assert_eq!(sender.send(chunk()), SendOutcome::Queued);
        clone.close();
        assert_eq!(sender.send(chunk()), SendOutcome::Closed);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sender_counts_overflow() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = ChunkSender::new(tx);
        assert_eq!(sender.send(chunk()), SendOutcome::Queued);
        assert_eq!(sender.send(chunk()), SendOutcome::QueueFull);
        assert_eq!(sender.dropped(), 1);
    }

    #[test]
    fn test_detached_sender() {
        let sender = ChunkSender::detached();
        assert!(sender.is_closed());
        assert_eq!(sender.send(chunk()), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_event_stream_preserves_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = EventStream::new(rx);
        tx.send(InboundEvent::Interrupted).unwrap();
        tx.send(InboundEvent::TurnComplete).unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Some(InboundEvent::Interrupted));
        assert_eq!(stream.recv().await, Some(InboundEvent::TurnComplete));
        assert_eq!(stream.next().await, None);
    }
}
