//! Hand-driven devices for deterministic tests and embedding.
//!
//! [`ManualOutput`] has a clock that only moves when [`ManualOutput::advance`]
//! is called, and records every buffer it is asked to play. [`ManualMicrophone`]
//! delivers exactly the blocks pushed into it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    CaptureFormat, DeviceError, DeviceFaults, DeviceResult, MIC_BLOCK_QUEUE_CAPACITY,
    MicrophoneProvider, MicrophoneStream, OutputDevice, OutputDeviceProvider, PlaybackEnded,
    StreamControl,
};
use crate::core::codec::AudioFrame;

// =============================================================================
// Output
// =============================================================================

/// One `play_at` call as seen by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledPlay {
    pub id: u64,
    pub start: Duration,
    pub duration: Duration,
    pub samples: usize,
}

struct Voice {
    end: Duration,
    on_ended: PlaybackEnded,
}

#[derive(Default)]
struct OutputState {
    now: Duration,
    voices: BTreeMap<u64, Voice>,
    scheduled: Vec<ScheduledPlay>,
    stopped: Vec<(u64, Duration)>,
    completed: Vec<u64>,
    fail_plays: Option<DeviceError>,
    faults: Option<DeviceFaults>,
    closed: bool,
}

/// Output device whose clock is advanced by hand.
#[derive(Clone)]
pub struct ManualOutput {
    sample_rate: u32,
    state: Arc<Mutex<OutputState>>,
}

impl ManualOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Arc::new(Mutex::new(OutputState::default())),
        }
    }

    /// Device whose clock starts at `now` instead of zero.
    pub fn starting_at(sample_rate: u32, now: Duration) -> Self {
        let output = Self::new(sample_rate);
        output.state.lock().now = now;
        output
    }

    /// Move the clock forward, completing every buffer that ends by the new
    /// time in end-time order.
    pub fn advance(&self, by: Duration) {
        let finished = {
            let mut state = self.state.lock();
            state.now += by;
            let now = state.now;

            let mut done: Vec<(u64, Duration)> = state
                .voices
                .iter()
                .filter(|(_, v)| v.end <= now)
                .map(|(id, v)| (*id, v.end))
                .collect();
            done.sort_by_key(|(id, end)| (*end, *id));

            let mut callbacks = Vec::with_capacity(done.len());
            for (id, _) in done {
                if let Some(voice) = state.voices.remove(&id) {
                    state.completed.push(id);
                    callbacks.push(voice.on_ended);
                }
            }
            callbacks
        };

        for on_ended in finished {
            on_ended();
        }
    }

    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Every buffer handed to `play_at`, in call order.
    pub fn scheduled(&self) -> Vec<ScheduledPlay> {
        self.state.lock().scheduled.clone()
    }

    /// Ids stopped before completing, with the clock time of the stop.
    pub fn stopped(&self) -> Vec<(u64, Duration)> {
        self.state.lock().stopped.clone()
    }

    /// Ids that played to their end.
    pub fn completed(&self) -> Vec<u64> {
        self.state.lock().completed.clone()
    }

    /// Ids scheduled or playing right now.
    pub fn active(&self) -> Vec<u64> {
        self.state.lock().voices.keys().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Make subsequent `play_at` calls fail with `error`.
    pub fn fail_plays(&self, error: DeviceError) {
        self.state.lock().fail_plays = Some(error);
    }

    /// Report an asynchronous device failure, as a disconnected speaker would.
    pub fn inject_fault(&self, error: DeviceError) -> bool {
        match self.state.lock().faults.as_ref() {
            Some(faults) => faults.send(error).is_ok(),
            None => false,
        }
    }

    /// Provider that hands out this device.
    pub fn provider(&self) -> ManualOutputProvider {
        ManualOutputProvider {
            output: self.clone(),
            opens: Arc::new(AtomicU32::new(0)),
            fail_open: Arc::new(Mutex::new(None)),
        }
    }
}

impl OutputDevice for ManualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> Duration {
        self.now()
    }

    fn play_at(
        &self,
        id: u64,
        frame: AudioFrame,
        start_at: Duration,
        on_ended: PlaybackEnded,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DeviceError::Unavailable("output device closed".to_string()));
        }
        if let Some(error) = state.fail_plays.clone() {
            return Err(error);
        }

        let start = start_at.max(state.now);
        let duration = frame.duration();
        state.scheduled.push(ScheduledPlay {
            id,
            start,
            duration,
            samples: frame.frame_count(),
        });
        state.voices.insert(
            id,
            Voice {
                end: start + duration,
                on_ended,
            },
        );
        Ok(())
    }

    fn stop(&self, id: u64) {
        let mut state = self.state.lock();
        if state.voices.remove(&id).is_some() {
            let now = state.now;
            state.stopped.push((id, now));
        }
    }

    fn close(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.voices.clear();
        state.faults = None;
        state.closed = true;
        Ok(())
    }
}

/// Hands out a shared [`ManualOutput`].
#[derive(Clone)]
pub struct ManualOutputProvider {
    output: ManualOutput,
    opens: Arc<AtomicU32>,
    fail_open: Arc<Mutex<Option<DeviceError>>>,
}

impl ManualOutputProvider {
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Make subsequent opens fail.
    pub fn fail_open(&self, error: DeviceError) {
        *self.fail_open.lock() = Some(error);
    }
}

#[async_trait]
impl OutputDeviceProvider for ManualOutputProvider {
    async fn open(
        &self,
        _sample_rate: u32,
        faults: DeviceFaults,
    ) -> DeviceResult<Arc<dyn OutputDevice>> {
        if let Some(error) = self.fail_open.lock().clone() {
            return Err(error);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.output.state.lock();
            state.closed = false;
            state.faults = Some(faults);
        }
        Ok(Arc::new(self.output.clone()))
    }
}

// =============================================================================
// Microphone
// =============================================================================

#[derive(Default)]
struct MicShared {
    block_tx: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    faults: Mutex<Option<DeviceFaults>>,
    denied: Mutex<Option<String>>,
    access_requests: AtomicU32,
    opens: AtomicU32,
    releases: AtomicU32,
}

/// Microphone that delivers exactly the blocks pushed into it.
#[derive(Clone, Default)]
pub struct ManualMicrophone {
    shared: Arc<MicShared>,
}

impl ManualMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse access with the given reason.
    pub fn deny_access(&self, reason: impl Into<String>) {
        *self.shared.denied.lock() = Some(reason.into());
    }

    /// Deliver a block of mono samples. Returns `false` if the stream is not
    /// open or its queue is full.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        match self.shared.block_tx.lock().as_ref() {
            Some(tx) => tx.try_send(samples).is_ok(),
            None => false,
        }
    }

    /// End the stream as if the device vanished.
    pub fn end_stream(&self) {
        self.shared.block_tx.lock().take();
    }

    /// Report an asynchronous device failure.
    pub fn inject_fault(&self, error: DeviceError) -> bool {
        match self.shared.faults.lock().as_ref() {
            Some(faults) => faults.send(error).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.block_tx.lock().is_some()
    }

    pub fn access_requests(&self) -> u32 {
        self.shared.access_requests.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u32 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u32 {
        self.shared.releases.load(Ordering::SeqCst)
    }
}

struct ManualControl {
    shared: Arc<MicShared>,
}

impl StreamControl for ManualControl {
    fn release(&mut self) -> DeviceResult<()> {
        self.shared.block_tx.lock().take();
        self.shared.faults.lock().take();
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MicrophoneProvider for ManualMicrophone {
    async fn request_access(&self) -> DeviceResult<()> {
        self.shared.access_requests.fetch_add(1, Ordering::SeqCst);
        match self.shared.denied.lock().clone() {
            Some(reason) => Err(DeviceError::PermissionDenied(reason)),
            None => Ok(()),
        }
    }

    async fn open(
        &self,
        format: CaptureFormat,
        faults: DeviceFaults,
    ) -> DeviceResult<MicrophoneStream> {
        if let Some(reason) = self.shared.denied.lock().clone() {
            return Err(DeviceError::PermissionDenied(reason));
        }

        let (tx, rx) = mpsc::channel(MIC_BLOCK_QUEUE_CAPACITY);
        *self.shared.block_tx.lock() = Some(tx);
        *self.shared.faults.lock() = Some(faults);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        Ok(MicrophoneStream {
            sample_rate: format.sample_rate,
            blocks: rx,
            control: Box::new(ManualControl {
                shared: self.shared.clone(),
            }),
        })
    }
}
