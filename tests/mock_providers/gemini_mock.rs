//! WebSocket Mock Server for Gemini Live
//!
//! Accepts connections with `tokio_tungstenite::accept_hdr_async`, answers the
//! `setup` message according to [`SetupReply`], records every client message
//! and forwards scripted frames pushed by the test.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// How the mock answers the client's `setup` message
#[derive(Debug, Clone)]
pub enum SetupReply {
    /// Send `{"setupComplete": {}}`
    Complete,
    /// Never answer
    Ignore,
    /// Close the socket with this code and reason
    Close(u16, String),
}

/// Mock server behavior
#[derive(Debug, Clone)]
pub struct GeminiMockConfig {
    /// Refuse the WebSocket upgrade with this HTTP status
    pub reject_status: Option<u16>,
    pub setup_reply: SetupReply,
}

impl Default for GeminiMockConfig {
    fn default() -> Self {
        Self {
            reject_status: None,
            setup_reply: SetupReply::Complete,
        }
    }
}

/// Shared state of a running mock
#[derive(Default)]
pub struct GeminiMockState {
    pub connection_count: AtomicU64,
    received: Mutex<Vec<Value>>,
    query: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// Handle to a mock Gemini Live server on an ephemeral port
pub struct GeminiMock {
    pub addr: SocketAddr,
    pub state: Arc<GeminiMockState>,
}

impl GeminiMock {
    /// Endpoint to hand to the client
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Query string of the most recent upgrade request
    pub fn last_query(&self) -> Option<String> {
        self.state.query.lock().clone()
    }

    /// Every JSON message received from clients, in order
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    /// Received messages carrying `realtimeInput`
    pub fn realtime_inputs(&self) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m.get("realtimeInput").is_some())
            .collect()
    }

    /// Push a JSON text frame to the current connection
    pub fn send_json(&self, value: Value) -> bool {
        self.push(Message::Text(value.to_string().into()))
    }

    /// Push a JSON frame as binary, as the live API sometimes does
    pub fn send_json_binary(&self, value: Value) -> bool {
        self.push(Message::Binary(value.to_string().into_bytes().into()))
    }

    /// Close the current connection with a code and reason
    pub fn close_with(&self, code: u16, reason: &str) -> bool {
        self.push(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })))
    }

    fn push(&self, message: Message) -> bool {
        match self.state.outbound.lock().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Poll until `count` realtime inputs have arrived or `timeout` passes
    pub async fn wait_for_inputs(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.realtime_inputs().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Poll until the current connection has gone away
    pub async fn wait_for_disconnect(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.state.outbound.lock().is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// Server content message with model audio
pub fn audio_message(pcm: &[u8]) -> Value {
    use base64::Engine;
    json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{
                    "inlineData": {
                        "mimeType": "audio/pcm;rate=24000",
                        "data": base64::engine::general_purpose::STANDARD.encode(pcm)
                    }
                }]
            }
        }
    })
}

/// Server content message with a transcript fragment
pub fn transcript_message(user: bool, text: &str) -> Value {
    let field = if user {
        "inputTranscription"
    } else {
        "outputTranscription"
    };
    json!({ "serverContent": { field: { "text": text } } })
}

pub fn interrupted_message() -> Value {
    json!({ "serverContent": { "interrupted": true } })
}

pub fn turn_complete_message() -> Value {
    json!({ "serverContent": { "turnComplete": true } })
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    state: Arc<GeminiMockState>,
    config: GeminiMockConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let query_state = state.clone();
    let reject_status = config.reject_status;
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        *query_state.query.lock() = request.uri().query().map(str::to_string);
        match reject_status {
            Some(status) => Err(http::Response::builder()
                .status(status)
                .body(Some("rejected by mock".to_string()))
                .unwrap()),
            None => Ok(response),
        }
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws_stream.split();

    state.connection_count.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    *state.outbound.lock() = Some(outbound_tx);

    loop {
        tokio::select! {
            Some(message) = outbound_rx.recv() => {
                let closing = matches!(message, Message::Close(_));
                write.send(message).await?;
                if closing {
                    break;
                }
            }

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str())?;
                    let is_setup = value.get("setup").is_some();
                    state.received.lock().push(value);

                    if is_setup {
                        match &config.setup_reply {
                            SetupReply::Complete => {
                                let complete = json!({ "setupComplete": {} });
                                write.send(Message::Text(complete.to_string().into())).await?;
                            }
                            SetupReply::Ignore => {}
                            SetupReply::Close(code, reason) => {
                                write
                                    .send(Message::Close(Some(CloseFrame {
                                        code: CloseCode::from(*code),
                                        reason: reason.clone().into(),
                                    })))
                                    .await?;
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    eprintln!("Gemini mock WebSocket error: {}", e);
                    break;
                }
            }
        }
    }

    state.outbound.lock().take();
    Ok(())
}

/// Start a mock server on an ephemeral port
pub async fn spawn_gemini_mock(config: GeminiMockConfig) -> GeminiMock {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(GeminiMockState::default());

    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = accept_state.clone();
            let config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state, config).await {
                    eprintln!("Gemini mock connection error: {}", e);
                }
            });
        }
    });

    GeminiMock { addr, state }
}
