//! Gemini Live API client implementation.
//!
//! This module provides the Gemini Live transport that implements the
//! `BaseTransport` trait over Google's `BidiGenerateContent` WebSocket API.
//!
//! # API Reference
//!
//! - Endpoint: `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=<key>`
//! - Protocol: WebSocket with JSON messages (text or binary frames)
//! - Input audio: PCM 16-bit, 16kHz, mono, little-endian, base64 encoded
//! - Output audio: PCM 16-bit, 24kHz, mono, little-endian, base64 encoded
//!
//! The first client message must be `setup`; the channel is ready once the
//! server answers with `setupComplete`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::config::{DEFAULT_SYSTEM_INSTRUCTION, GEMINI_LIVE_URL, GeminiLiveModel, GeminiLiveVoice};
use super::messages::{
    AudioTranscriptionConfig, ClientMessage, Content, GenerationConfig, PrebuiltVoiceConfig,
    ServerMessage, SetupConfig, SpeechConfig, VoiceConfig,
};
use crate::core::codec::EncodedChunk;
use crate::core::transport::base::{
    BaseTransport, BoxedTransport, ChunkSender, ConnectionState, EventStream, InboundEvent,
    TransportConfig, TransportError, TransportFactory, TransportResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for the connection task to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

// =============================================================================
// Gemini Live Client
// =============================================================================

/// Gemini Live API client implementation.
///
/// # Thread Safety
///
/// State shared with the spawned WebSocket task lives behind `Arc`s. The
/// `connected` flag uses `Arc<AtomicBool>` for lock-free status checks.
pub struct GeminiLive {
    api_key: String,
    endpoint: String,
    state: Arc<Mutex<ConnectionState>>,
    connected: Arc<AtomicBool>,
    /// Suppresses the trailing `Closed` event for locally requested closes
    intentional_close: Arc<AtomicBool>,
    sender: ChunkSender,
    events: Option<EventStream>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    connection_handle: Option<JoinHandle<()>>,
    model: GeminiLiveModel,
    voice: GeminiLiveVoice,
}

impl GeminiLive {
    /// Client for the public Gemini Live endpoint.
    pub fn new(api_key: String) -> TransportResult<Self> {
        Self::with_endpoint(api_key, GEMINI_LIVE_URL.to_string())
    }

    /// Client for a custom endpoint (proxies, tests).
    pub fn with_endpoint(api_key: String, endpoint: String) -> TransportResult<Self> {
        if api_key.trim().is_empty() {
            return Err(TransportError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }
        validate_endpoint(&endpoint)?;

        Ok(Self {
            api_key,
            endpoint,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            connected: Arc::new(AtomicBool::new(false)),
            intentional_close: Arc::new(AtomicBool::new(false)),
            sender: ChunkSender::detached(),
            events: None,
            shutdown_tx: None,
            connection_handle: None,
            model: GeminiLiveModel::default(),
            voice: GeminiLiveVoice::default(),
        })
    }

    fn build_ws_url(&self) -> TransportResult<url::Url> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| TransportError::InvalidConfiguration(e.to_string()))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Build the `setup` message for a session configuration.
    pub fn build_setup(
        config: &TransportConfig,
        model: GeminiLiveModel,
        voice: GeminiLiveVoice,
    ) -> SetupConfig {
        let instruction = config
            .system_instruction
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string());

        SetupConfig {
            model: model.resource_name(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.as_str().to_string(),
                        },
                    },
                }),
            },
            system_instruction: (!instruction.is_empty()).then(|| Content::text(instruction)),
            input_audio_transcription: config
                .input_transcription
                .then(AudioTranscriptionConfig::default),
            output_audio_transcription: config
                .output_transcription
                .then(AudioTranscriptionConfig::default),
        }
    }

    fn resolve_model(requested: &str) -> GeminiLiveModel {
        if requested.is_empty() {
            return GeminiLiveModel::default();
        }
        let model = GeminiLiveModel::from_str_or_default(requested);
        if !requested.trim_start_matches("models/").eq_ignore_ascii_case(model.as_str()) {
            tracing::warn!("Unknown Gemini Live model '{}', using {}", requested, model);
        }
        model
    }

    fn resolve_voice(requested: Option<&str>) -> GeminiLiveVoice {
        let Some(requested) = requested else {
            return GeminiLiveVoice::default();
        };
        let voice = GeminiLiveVoice::from_str_or_default(requested);
        if !requested.eq_ignore_ascii_case(voice.as_str()) {
            tracing::warn!("Unknown Gemini Live voice '{}', using {}", requested, voice);
        }
        voice
    }
}

fn validate_endpoint(endpoint: &str) -> TransportResult<()> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| TransportError::InvalidConfiguration(format!("invalid endpoint: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(TransportError::InvalidConfiguration(format!(
            "endpoint scheme must be ws or wss, got {other}"
        ))),
    }
}

fn map_connect_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            match status {
                401 | 403 => TransportError::AuthenticationFailed(format!("HTTP {status}")),
                _ => TransportError::ConnectionFailed(format!("HTTP {status}")),
            }
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

// =============================================================================
// Connection Task
// =============================================================================

struct ConnectionTask {
    chunk_rx: mpsc::Receiver<EncodedChunk>,
    event_tx: mpsc::UnboundedSender<InboundEvent>,
    shutdown_rx: oneshot::Receiver<()>,
    ready_tx: Option<oneshot::Sender<TransportResult<()>>>,
    state: Arc<Mutex<ConnectionState>>,
    connected: Arc<AtomicBool>,
    intentional_close: Arc<AtomicBool>,
}

impl ConnectionTask {
    fn emit(&self, event: InboundEvent) {
        let _ = self.event_tx.send(event);
    }

    fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => tracing::warn!("Failed to parse server message: {}", e),
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        if message.is_setup_complete() {
            tracing::debug!("Gemini Live setup complete");
            if let Some(tx) = self.ready_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }

        if let Some(go_away) = &message.go_away {
            tracing::warn!(
                "Gemini Live server will disconnect soon (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        if message.tool_call.is_some() {
            tracing::debug!("Ignoring tool call request");
        }

        if let Some(content) = message.server_content {
            for event in content.into_events() {
                tracing::trace!("Inbound event: {}", event.kind());
                self.emit(event);
            }
        }
    }

    async fn run(mut self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();
        let mut failure: Option<String> = None;

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        tracing::debug!("Failed to send close frame: {}", e);
                    }
                    break;
                }

                Some(chunk) = self.chunk_rx.recv() => {
                    let json = match serde_json::to_string(&ClientMessage::audio(&chunk)) {
                        Ok(j) => j,
                        Err(e) => {
                            tracing::error!("Failed to serialize audio chunk: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        failure = Some(e.to_string());
                        break;
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.handle_text(text),
                            Err(e) => tracing::warn!("Binary frame is not UTF-8 JSON: {}", e),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                tracing::error!("Failed to send pong: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            match frame {
                                Some(frame) if frame.code != CloseCode::Normal => {
                                    let code: u16 = frame.code.into();
                                    tracing::warn!("WebSocket closed by server: {} {}", code, frame.reason.as_str());
                                    failure = Some(format!("closed with code {}: {}", code, frame.reason.as_str()));
                                }
                                _ => tracing::info!("WebSocket closed by server"),
                            }
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error: {}", e);
                            failure = Some(e.to_string());
                            break;
                        }
                        None => {
                            tracing::info!("WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        *self.state.lock() = if failure.is_some() {
            ConnectionState::Failed
        } else {
            ConnectionState::Closed
        };

        if let Some(tx) = self.ready_tx.take() {
            let reason = failure
                .clone()
                .unwrap_or_else(|| "connection closed before setup completed".to_string());
            let _ = tx.send(Err(TransportError::ConnectionFailed(reason)));
            return;
        }

        if !self.intentional_close.load(Ordering::SeqCst) {
            if let Some(reason) = failure {
                self.emit(InboundEvent::Error(reason));
            }
            self.emit(InboundEvent::Closed);
        }
    }
}

#[async_trait]
impl BaseTransport for GeminiLive {
    async fn open(&mut self, config: TransportConfig) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.intentional_close.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        self.model = Self::resolve_model(&config.model);
        self.voice = Self::resolve_voice(config.voice.as_deref());

        let url = self.build_ws_url()?;
        let (mut ws, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                return Err(map_connect_error(e));
            }
        };

        tracing::info!("Connected to Gemini Live API at {}", self.endpoint);

        let setup = ClientMessage::Setup(Self::build_setup(&config, self.model, self.voice));
        let json = serde_json::to_string(&setup)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        if let Err(e) = ws.send(Message::Text(json.into())).await {
            self.set_state(ConnectionState::Failed);
            return Err(TransportError::WebSocketError(e.to_string()));
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        self.sender = ChunkSender::new(chunk_tx);
        self.events = Some(EventStream::new(event_rx));
        self.shutdown_tx = Some(shutdown_tx);

        let task = ConnectionTask {
            chunk_rx,
            event_tx,
            shutdown_rx,
            ready_tx: Some(ready_tx),
            state: self.state.clone(),
            connected: self.connected.clone(),
            intentional_close: self.intentional_close.clone(),
        };
        self.connection_handle = Some(tokio::spawn(task.run(ws)));

        match ready_rx.await {
            Ok(Ok(())) => {
                self.connected.store(true, Ordering::SeqCst);
                self.set_state(ConnectionState::Connected);
                tracing::info!(
                    "Gemini Live session ready (model: {}, voice: {})",
                    self.model,
                    self.voice
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
            Err(_) => {
                self.set_state(ConnectionState::Failed);
                Err(TransportError::ConnectionFailed(
                    "connection task ended before setup completed".to_string(),
                ))
            }
        }
    }

    fn sender(&self) -> ChunkSender {
        self.sender.clone()
    }

    fn events(&mut self) -> TransportResult<EventStream> {
        if self.connection_handle.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.events.take().ok_or(TransportError::EventStreamTaken)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.intentional_close.store(true, Ordering::SeqCst);
        self.sender.close();

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut handle) = self.connection_handle.take()
            && tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err()
        {
            tracing::warn!("Gemini Live connection task did not stop in time, aborting");
            handle.abort();
        }

        self.connected.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
        self.events = None;

        tracing::info!("Disconnected from Gemini Live API");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn get_connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn get_provider_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": "gemini",
            "api_type": "WebSocket Live",
            "model": self.model.as_str(),
            "voice": self.voice.as_str(),
            "audio_formats": {
                "input": "pcm16 16kHz mono",
                "output": "pcm16 24kHz mono"
            },
            "voices": GeminiLiveVoice::all().iter().map(|v| v.as_str()).collect::<Vec<_>>(),
            "features": {
                "bidirectional_audio": true,
                "input_transcription": true,
                "output_transcription": true,
                "barge_in": true
            }
        })
    }
}

impl Drop for GeminiLive {
    fn drop(&mut self) {
        if let Some(handle) = self.connection_handle.take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Creates one [`GeminiLive`] client per session start.
#[derive(Debug, Clone)]
pub struct GeminiLiveFactory {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveFactory {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            endpoint: GEMINI_LIVE_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }
}

impl TransportFactory for GeminiLiveFactory {
    fn create(&self) -> TransportResult<BoxedTransport> {
        let client = GeminiLive::with_endpoint(self.api_key.clone(), self.endpoint.clone())?;
        Ok(Box::new(client))
    }
}

// =============================================================================
// Tests
// =============================================================================
