//! In-process transport driven by a [`LoopbackController`].
//!
//! Lets a host or a test play the part of the remote agent: decide when the
//! channel becomes ready, push inbound events, and inspect the audio chunks
//! the session sent, all without a network.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::base::{
    BaseTransport, BoxedTransport, ChunkSender, ConnectionState, EventStream, InboundEvent,
    TransportConfig, TransportError, TransportFactory, TransportResult,
};
use crate::core::codec::EncodedChunk;

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenBehavior {
    Ready,
    Hold,
    Fail(String),
}

#[derive(Debug)]
struct Shared {
    behavior: Mutex<OpenBehavior>,
    ready: watch::Sender<bool>,
    hang_on_close: Mutex<bool>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<InboundEvent>>>,
    chunk_rx: Mutex<Option<mpsc::Receiver<EncodedChunk>>>,
    sent: Mutex<Vec<EncodedChunk>>,
    last_config: Mutex<Option<TransportConfig>>,
    opens: AtomicU32,
    closes: AtomicU32,
}

/// Agent-side handle for loopback transports.
#[derive(Debug, Clone)]
pub struct LoopbackController {
    shared: Arc<Shared>,
}

impl LoopbackController {
    /// Controller whose transports become ready as soon as they open.
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                behavior: Mutex::new(OpenBehavior::Ready),
                ready,
                hang_on_close: Mutex::new(false),
                event_tx: Mutex::new(None),
                chunk_rx: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                last_config: Mutex::new(None),
                opens: AtomicU32::new(0),
                closes: AtomicU32::new(0),
            }),
        }
    }

    /// Make `open` wait until [`mark_ready`](Self::mark_ready) is called.
    pub fn hold_ready(&self) {
        *self.shared.behavior.lock() = OpenBehavior::Hold;
        self.shared.ready.send_replace(false);
    }

    /// Release a held `open`.
    pub fn mark_ready(&self) {
        self.shared.ready.send_replace(true);
    }

    /// Make the next `open` calls fail with the given reason.
    pub fn fail_open(&self, reason: impl Into<String>) {
        *self.shared.behavior.lock() = OpenBehavior::Fail(reason.into());
    }

    /// Make `close` never complete, to exercise bounded teardown.
    pub fn hang_on_close(&self) {
        *self.shared.hang_on_close.lock() = true;
    }

    /// Deliver an event on the current connection. Returns `false` if there
    /// is no open connection.
    pub fn push(&self, event: InboundEvent) -> bool {
        match self.shared.event_tx.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Simulate the agent hanging up.
    pub fn close_from_agent(&self) {
        if let Some(tx) = self.shared.event_tx.lock().take() {
            let _ = tx.send(InboundEvent::Closed);
        }
    }

    /// All chunks sent so far, in send order.
    pub fn sent_chunks(&self) -> Vec<EncodedChunk> {
        let mut sent = self.shared.sent.lock();
        if let Some(rx) = self.shared.chunk_rx.lock().as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                sent.push(chunk);
            }
        }
        sent.clone()
    }

    /// Configuration passed to the most recent `open`.
    pub fn last_config(&self) -> Option<TransportConfig> {
        self.shared.last_config.lock().clone()
    }

    pub fn open_count(&self) -> u32 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Factory producing transports bound to this controller.
    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory {
            controller: self.clone(),
        }
    }
}

impl Default for LoopbackController {
    fn default() -> Self {
        Self::new()
    }
}

/// Session-side end of a loopback channel.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    state: ConnectionState,
    sender: ChunkSender,
    events: Option<EventStream>,
}

impl LoopbackTransport {
    pub fn new(controller: &LoopbackController) -> Self {
        Self {
            shared: controller.shared.clone(),
            state: ConnectionState::Disconnected,
            sender: ChunkSender::detached(),
            events: None,
        }
    }
}

#[async_trait]
impl BaseTransport for LoopbackTransport {
    async fn open(&mut self, config: TransportConfig) -> TransportResult<()> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        self.state = ConnectionState::Connecting;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        *self.shared.event_tx.lock() = Some(event_tx);
        *self.shared.chunk_rx.lock() = Some(chunk_rx);
        *self.shared.last_config.lock() = Some(config);
        self.sender = ChunkSender::new(chunk_tx);
        self.events = Some(EventStream::new(event_rx));

        let behavior = self.shared.behavior.lock().clone();
        match behavior {
            OpenBehavior::Ready => {}
            OpenBehavior::Fail(reason) => {
                self.state = ConnectionState::Failed;
                return Err(TransportError::ConnectionFailed(reason));
            }
            OpenBehavior::Hold => {
                let mut ready = self.shared.ready.subscribe();
                ready
                    .wait_for(|r| *r)
                    .await
                    .map_err(|_| TransportError::ConnectionFailed("controller dropped".to_string()))?;
            }
        }

        self.state = ConnectionState::Connected;
        tracing::debug!("Loopback transport ready");
        Ok(())
    }

    fn sender(&self) -> ChunkSender {
        self.sender.clone()
    }

    fn events(&mut self) -> TransportResult<EventStream> {
        match self.state {
            ConnectionState::Disconnected => Err(TransportError::NotConnected),
            _ => self.events.take().ok_or(TransportError::EventStreamTaken),
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        self.sender.close();
        self.shared.event_tx.lock().take();
        self.state = ConnectionState::Closed;

        let hang = *self.shared.hang_on_close.lock();
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn get_connection_state(&self) -> ConnectionState {
        self.state
    }

    fn get_provider_info(&self) -> serde_json::Value {
        serde_json::json!({
            "provider": "loopback",
            "api_type": "In-process",
            "features": {
                "bidirectional_audio": true,
                "transcription": true
            }
        })
    }
}

/// Factory for [`LoopbackTransport`]s sharing one controller.
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    controller: LoopbackController,
}

impl TransportFactory for LoopbackFactory {
    fn create(&self) -> TransportResult<BoxedTransport> {
        Ok(Box::new(LoopbackTransport::new(&self.controller)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn chunk(byte: u8) -> EncodedChunk {
        EncodedChunk {
            data: Bytes::from(vec![byte, 0]),
            mime_type: "audio/pcm;rate=16000".to_string(),
        }
    }

    #[tokio::test]
    async fn test_open_send_close() {
        let controller = LoopbackController::new();
        let mut transport = LoopbackTransport::new(&controller);

        assert!(matches!(transport.events(), Err(TransportError::NotConnected)));
        transport.open(TransportConfig::default()).await.unwrap();
        assert!(transport.is_ready());

        transport.send(chunk(1));
        transport.send(chunk(2));
        transport.close().await.unwrap();
        transport.send(chunk(3));

        let sent = controller.sent_chunks();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data[0], 1);
        assert_eq!(sent[1].data[0], 2);
        assert_eq!(controller.open_count(), 1);
        assert_eq!(controller.close_count(), 1);
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let controller = LoopbackController::new();
        let mut transport = LoopbackTransport::new(&controller);
        transport.open(TransportConfig::default()).await.unwrap();

        let mut events = transport.events().unwrap();
        assert!(matches!(transport.events(), Err(TransportError::EventStreamTaken)));

        assert!(controller.push(InboundEvent::TurnComplete));
        controller.close_from_agent();
        assert_eq!(events.recv().await, Some(InboundEvent::TurnComplete));
        assert_eq!(events.recv().await, Some(InboundEvent::Closed));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_held_open_waits_for_ready() {
        let controller = LoopbackController::new();
        controller.hold_ready();
        let mut transport = LoopbackTransport::new(&controller);

        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            transport.open(TransportConfig::default()),
        )
        .await;
        assert!(pending.is_err());

        controller.mark_ready();
        transport.open(TransportConfig::default()).await.unwrap();
        assert_eq!(transport.get_connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_open() {
        let controller = LoopbackController::new();
        controller.fail_open("agent unavailable");
        let mut transport = controller.factory().create().unwrap();

        let err = transport.open(TransportConfig::default()).await.unwrap_err();
        assert!(err.to_string().contains("agent unavailable"));
        assert_eq!(transport.get_connection_state(), ConnectionState::Failed);
    }
}
