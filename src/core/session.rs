//! Voice session state machine.
//!
//! A [`VoiceSession`] is a cloneable handle onto a single coordinator task.
//! The coordinator owns the transport, the capture pipeline and the playback
//! scheduler, and is the only place session state changes:
//!
//! ```text
//! Idle -> Connecting -> Active -> Closing -> Idle
//!              \____________________^
//! ```
//!
//! Inbound events, device faults and host commands are all consumed by the
//! coordinator's `select!` loop, so they are applied one at a time and in
//! arrival order. Teardown always runs the same steps in the same order
//! (microphone, output device, transport), each bounded by a timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

use crate::core::capture::{CaptureConfig, CapturePipeline, CaptureStats, LoudnessMeter};
use crate::core::codec::{self, PLAYBACK_SAMPLE_RATE};
use crate::core::devices::{DeviceError, DeviceFaults, MicrophoneProvider, OutputDeviceProvider};
use crate::core::playback::PlaybackScheduler;
use crate::core::transcript::{TranscriptAccumulator, TranscriptSnapshot};
use crate::core::transport::{
    BoxedTransport, EventStream, InboundEvent, TransportConfig, TransportError, TransportFactory,
};
use crate::errors::{SessionError, SessionResult};

/// Default bound on the `Connecting` phase.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on each teardown step.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_millis(2000);

const NOTICE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Closing => write!(f, "Closing"),
        }
    }
}

/// Out-of-band messages for the host UI.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// Something was dropped but the session continues
    Warning(String),
    /// The session ended because of this error
    Fatal(SessionError),
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sent to the agent when the channel opens
    pub transport: TransportConfig,
    pub capture: CaptureConfig,
    /// Rate of inbound agent audio
    pub playback_sample_rate: u32,
    /// Bound on the whole `Connecting` phase
    pub connect_timeout: Duration,
    /// Bound on each teardown step
    pub teardown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            capture: CaptureConfig::default(),
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

enum Command {
    Start(oneshot::Sender<SessionResult<()>>),
    Stop(oneshot::Sender<()>),
}

/// Host-facing handle to a voice session.
///
/// # Example
///
/// ```rust,ignore
/// use waav_live::{SessionConfig, VoiceSession};
///
/// let session = VoiceSession::new(config, factory, microphone, output);
/// session.start().await?;
///
/// let mut transcript = session.watch_transcript();
/// while transcript.changed().await.is_ok() {
///     println!("agent: {}", transcript.borrow().agent);
/// }
///
/// session.stop().await;
/// ```
#[derive(Clone)]
pub struct VoiceSession {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    transcript_rx: watch::Receiver<TranscriptSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    meter: LoudnessMeter,
    stats: Arc<CaptureStats>,
}

impl VoiceSession {
    /// Spawn the session coordinator. Must be called within a Tokio runtime.
    ///
    /// The coordinator exits once every handle has been dropped, tearing
    /// down any active session first.
    pub fn new(
        config: SessionConfig,
        transports: Arc<dyn TransportFactory>,
        microphone: Arc<dyn MicrophoneProvider>,
        output: Arc<dyn OutputDeviceProvider>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (transcript_tx, transcript_rx) = watch::channel(TranscriptSnapshot::default());
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let meter = LoudnessMeter::new();
        let capture = CapturePipeline::new(config.capture, meter.clone());
        let stats = capture.stats();

        let coordinator = Coordinator {
            config,
            providers: Providers {
                transports,
                microphone,
                output,
            },
            commands: command_rx,
            state_tx,
            transcript_tx,
            notices: notices.clone(),
            capture,
            transcript: TranscriptAccumulator::new(),
        };
        tokio::spawn(coordinator.run());

        Self {
            commands: command_tx,
            state_rx,
            transcript_rx,
            notices,
            meter,
            stats,
        }
    }

    /// Open the session. Resolves once it is `Active`, or with the error
    /// that returned it to `Idle`.
    ///
    /// Fails immediately with [`SessionError::InvalidState`] unless the
    /// session is `Idle`.
    pub async fn start(&self) -> SessionResult<()> {
        let state = *self.state_rx.borrow();
        if state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation: "start",
                state,
            });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Start(reply_tx))
            .map_err(|_| SessionError::Shutdown)?;
        reply_rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Close the session and wait until it is `Idle`. Safe to call in any
    /// state and from any task; extra calls are no-ops.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(reply_tx)).is_err() {
            return;
        }
        let _ = reply_rx.await;
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// RMS loudness of the most recent captured frame.
    pub fn audio_level(&self) -> f32 {
        self.meter.level()
    }

    pub fn transcript(&self) -> TranscriptSnapshot {
        self.transcript_rx.borrow().clone()
    }

    pub fn watch_transcript(&self) -> watch::Receiver<TranscriptSnapshot> {
        self.transcript_rx.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn capture_stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Default)]
struct SessionResources {
    transport: Option<BoxedTransport>,
    scheduler: Option<PlaybackScheduler>,
}

enum Flow {
    Continue,
    Exit(Option<SessionError>),
}

/// Where a session gets its agent channel and audio devices from.
struct Providers {
    transports: Arc<dyn TransportFactory>,
    microphone: Arc<dyn MicrophoneProvider>,
    output: Arc<dyn OutputDeviceProvider>,
}

impl Providers {
    /// Acquire microphone permission, open the transport and the output
    /// device, then start capture.
    async fn establish(
        &self,
        config: &SessionConfig,
        capture: &mut CapturePipeline,
        resources: &mut SessionResources,
        faults: DeviceFaults,
    ) -> SessionResult<EventStream> {
        self.microphone.request_access().await?;

        // Held in resources before opening so teardown can close a transport
        // whose open was abandoned
        let transport = resources.transport.insert(self.transports.create()?);
        transport.open(config.transport.clone()).await?;
        tracing::info!("Agent channel ready");
        let events = transport.events()?;
        let sender = transport.sender();

        let output = self
            .output
            .open(config.playback_sample_rate, faults.clone())
            .await?;
        resources.scheduler = Some(PlaybackScheduler::new(output));

        let stream = self
            .microphone
            .open(config.capture.format(), faults.clone())
            .await?;
        capture.start(stream, sender, faults)?;
        Ok(events)
    }
}

struct Coordinator {
    config: SessionConfig,
    providers: Providers,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SessionState>,
    transcript_tx: watch::Sender<TranscriptSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    capture: CapturePipeline,
    transcript: TranscriptAccumulator,
}

impl Coordinator {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Start(reply) => {
                    let span = tracing::info_span!("session", id = %Uuid::new_v4());
                    self.run_session(reply).instrument(span).await
                }
                Command::Stop(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        tracing::debug!("Session coordinator exiting");
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!("Session state: {} -> {}", previous, state);
        }
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn publish_transcript(&self) {
        self.transcript_tx.send_replace(self.transcript.snapshot());
    }

    async fn run_session(&mut self, reply: oneshot::Sender<SessionResult<()>>) {
        self.set_state(SessionState::Connecting);

        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let mut resources = SessionResources::default();
        let mut stop_waiters = Vec::new();
        // A failed start is answered only once the session is back to Idle
        let mut failed_start = None;

        let exit = match self.connect(&mut resources, fault_tx, &mut stop_waiters).await {
            Ok(events) => {
                self.set_state(SessionState::Active);
                let _ = reply.send(Ok(()));
                match resources.scheduler.as_ref() {
                    Some(scheduler) => {
                        let mut router = EventRouter {
                            transcript: &mut self.transcript,
                            transcript_tx: &self.transcript_tx,
                            notices: &self.notices,
                            scheduler,
                            playback_rate: self.config.playback_sample_rate,
                        };
                        Self::run_active(
                            &mut self.commands,
                            &mut router,
                            events,
                            &mut fault_rx,
                            &mut stop_waiters,
                        )
                        .await
                    }
                    None => Some(SessionError::Device(DeviceError::Unavailable(
                        "output device not open".to_string(),
                    ))),
                }
            }
            Err(error) => {
                failed_start = Some((reply, error.clone()));
                Some(error)
            }
        };

        match exit {
            Some(error) if error.is_fatal() => {
                tracing::error!("Session ended: {}", error);
                self.notify(SessionNotice::Fatal(error));
            }
            Some(error) => tracing::info!("Session ended: {}", error),
            None => tracing::info!("Session ended"),
        }

        self.set_state(SessionState::Closing);
        self.teardown(resources).await;
        self.transcript.clear();
        self.publish_transcript();
        self.set_state(SessionState::Idle);

        if let Some((reply, error)) = failed_start {
            let _ = reply.send(Err(error));
        }
        for waiter in stop_waiters {
            let _ = waiter.send(());
        }
    }

    /// Bring the channel and the audio devices up, bounded by the connect
    /// timeout and abandoned on `stop()`.
    async fn connect(
        &mut self,
        resources: &mut SessionResources,
        faults: DeviceFaults,
        stop_waiters: &mut Vec<oneshot::Sender<()>>,
    ) -> SessionResult<EventStream> {
        let timeout = self.config.connect_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let establish =
            self.providers
                .establish(&self.config, &mut self.capture, resources, faults);
        tokio::pin!(establish);

        loop {
            tokio::select! {
                result = &mut establish => return result,

                _ = &mut deadline => {
                    tracing::warn!("Session not active after {:?}", timeout);
                    return Err(TransportError::Timeout(format!(
                        "session not active after {timeout:?}"
                    ))
                    .into());
                }

                command = self.commands.recv() => match command {
                    Some(Command::Start(reply)) => {
                        let _ = reply.send(Err(SessionError::InvalidState {
                            operation: "start",
                            state: SessionState::Connecting,
                        }));
                    }
                    Some(Command::Stop(reply)) => {
                        tracing::info!("Stop requested while connecting");
                        stop_waiters.push(reply);
                        return Err(SessionError::Cancelled);
                    }
                    None => return Err(SessionError::Cancelled),
                }
            }
        }
    }

    async fn run_active(
        commands: &mut mpsc::UnboundedReceiver<Command>,
        router: &mut EventRouter<'_>,
        mut events: EventStream,
        faults: &mut mpsc::UnboundedReceiver<DeviceError>,
        stop_waiters: &mut Vec<oneshot::Sender<()>>,
    ) -> Option<SessionError> {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Stop(reply)) => {
                        tracing::info!("Stop requested");
                        stop_waiters.push(reply);
                        return None;
                    }
                    Some(Command::Start(reply)) => {
                        let _ = reply.send(Err(SessionError::InvalidState {
                            operation: "start",
                            state: SessionState::Active,
                        }));
                    }
                    None => return None,
                },

                Some(fault) = faults.recv() => {
                    tracing::error!("Audio device failed: {}", fault);
                    return Some(fault.into());
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Agent event stream ended");
                        return None;
                    };
                    if let Flow::Exit(error) = router.route(event) {
                        return error;
                    }
                }
            }
        }
    }

    /// Release microphone, output device and transport, in that order. Each
    /// step is bounded and failures are logged, never propagated.
    async fn teardown(&mut self, mut resources: SessionResources) {
        let limit = self.config.teardown_timeout;

        match tokio::time::timeout(limit, self.capture.stop()).await {
            Ok(Ok(())) => tracing::debug!("Microphone released"),
            Ok(Err(e)) => tracing::warn!("Failed to release microphone: {}", e),
            Err(_) => tracing::warn!("Timed out releasing microphone after {:?}", limit),
        }

        if let Some(scheduler) = resources.scheduler.take() {
            match tokio::time::timeout(limit, scheduler.close()).await {
                Ok(Ok(())) => tracing::debug!("Output device released"),
                Ok(Err(e)) => tracing::warn!("Failed to release output device: {}", e),
                Err(_) => tracing::warn!("Timed out releasing output device after {:?}", limit),
            }
        }

        if let Some(mut transport) = resources.transport.take() {
            match tokio::time::timeout(limit, transport.close()).await {
                Ok(Ok(())) => tracing::debug!("Agent channel closed"),
                Ok(Err(e)) => tracing::warn!("Failed to close agent channel: {}", e),
                Err(_) => tracing::warn!("Timed out closing agent channel after {:?}", limit),
            }
        }
    }
}

// =============================================================================
// Event Router
// =============================================================================

struct EventRouter<'a> {
    transcript: &'a mut TranscriptAccumulator,
    transcript_tx: &'a watch::Sender<TranscriptSnapshot>,
    notices: &'a broadcast::Sender<SessionNotice>,
    scheduler: &'a PlaybackScheduler,
    playback_rate: u32,
}

impl EventRouter<'_> {
    fn route(&mut self, event: InboundEvent) -> Flow {
        tracing::trace!("Routing {}", event.kind());
        match event {
            InboundEvent::AudioDelta(data) => {
                let generation = self.scheduler.generation();
                match codec::decode(&data, self.playback_rate, 1) {
                    Ok(frame) => {
                        if let Err(e) = self.scheduler.enqueue_for(generation, frame) {
                            return Flow::Exit(Some(e.into()));
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropping agent audio: {}", e);
                        let _ = self
                            .notices
                            .send(SessionNotice::Warning(format!("Dropped agent audio: {e}")));
                    }
                }
            }
            InboundEvent::TranscriptDelta { speaker, text } => {
                self.transcript.append(speaker, &text);
                self.transcript_tx.send_replace(self.transcript.snapshot());
            }
            InboundEvent::TurnComplete => {
                tracing::debug!("Agent turn complete");
                self.transcript.clear();
                self.transcript_tx.send_replace(self.transcript.snapshot());
            }
            InboundEvent::Interrupted => {
                let stopped = self.scheduler.flush();
                tracing::info!("Agent interrupted, {} playback item(s) stopped", stopped);
            }
            InboundEvent::Error(reason) => {
                return Flow::Exit(Some(TransportError::ProviderError(reason).into()));
            }
            InboundEvent::Closed => {
                tracing::info!("Agent closed the channel");
                return Flow::Exit(None);
            }
        }
        Flow::Continue
    }
}
