//! Microphone capture pipeline.
//!
//! Reads mono blocks from an open [`MicrophoneStream`], slices them into
//! fixed-size frames, meters and encodes each frame and queues it on the
//! transport without waiting on the network.

mod dispatch;
mod meter;

pub(crate) use dispatch::append_downmixed_samples;
pub use dispatch::CaptureStats;
pub use meter::{LoudnessMeter, rms};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::codec::CAPTURE_SAMPLE_RATE;
use crate::core::devices::{
    CaptureFormat, DeviceError, DeviceFaults, DeviceResult, MicrophoneStream, StreamControl,
};
use crate::core::transport::ChunkSender;
use dispatch::FrameDispatcher;

/// Default frame length: 512 samples, 32 ms at 16 kHz.
pub const DEFAULT_FRAME_SAMPLES: usize = 512;

/// Capture format settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
        }
    }
}

impl CaptureConfig {
    /// Duration of one frame.
    pub fn frame_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(
            (self.frame_samples as u128 * 1_000_000_000 / self.sample_rate as u128) as u64,
        )
    }

    /// Format requested from the microphone provider.
    pub fn format(&self) -> CaptureFormat {
        CaptureFormat {
            sample_rate: self.sample_rate,
            block_samples: self.frame_samples,
        }
    }
}

struct RunningCapture {
    token: CancellationToken,
    task: JoinHandle<Box<dyn StreamControl>>,
}

/// Owns the microphone stream while a session is active.
pub struct CapturePipeline {
    config: CaptureConfig,
    meter: LoudnessMeter,
    stats: Arc<CaptureStats>,
    running: Option<RunningCapture>,
}

impl CapturePipeline {
    pub fn new(config: CaptureConfig, meter: LoudnessMeter) -> Self {
        Self {
            config,
            meter,
            stats: Arc::new(CaptureStats::default()),
            running: None,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn meter(&self) -> &LoudnessMeter {
        &self.meter
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Begin delivering frames from `stream` to `sink`.
    ///
    /// An unexpected end of the stream is reported on `faults` as
    /// [`DeviceError::StreamEnded`]. The stream must deliver audio at the
    /// configured rate.
    pub fn start(
        &mut self,
        stream: MicrophoneStream,
        sink: ChunkSender,
        faults: DeviceFaults,
    ) -> DeviceResult<()> {
        if stream.sample_rate != self.config.sample_rate {
            let error = DeviceError::UnsupportedFormat(format!(
                "microphone delivers {} Hz, expected {} Hz",
                stream.sample_rate, self.config.sample_rate
            ));
            let mut control = stream.control;
            if let Err(e) = control.release() {
                tracing::warn!("Failed to release rejected microphone stream: {}", e);
            }
            return Err(error);
        }
        if let Some(previous) = self.running.take() {
            tracing::warn!("Capture restarted without stop; detaching previous stream");
            previous.token.cancel();
        }

        let MicrophoneStream {
            sample_rate,
            mut blocks,
            control,
        } = stream;
        let mut dispatcher = FrameDispatcher::new(
            self.config.frame_samples,
            sample_rate,
            sink,
            self.meter.clone(),
            self.stats.clone(),
        );

        let token = CancellationToken::new();
        let cancel = token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    block = blocks.recv() => match block {
                        Some(block) => {
                            dispatcher.push(&block);
                        }
                        None => {
                            tracing::warn!("Microphone stream ended unexpectedly");
                            let _ = faults.send(DeviceError::StreamEnded(
                                "microphone stream ended".to_string(),
                            ));
                            break;
                        }
                    }
                }
            }
            dispatcher.reset();
            control
        });

        tracing::debug!(
            "Capture started ({} Hz, {} samples per frame)",
            sample_rate,
            self.config.frame_samples
        );
        self.running = Some(RunningCapture { token, task });
        Ok(())
    }

    /// Detach from the stream and release the device.
    ///
    /// Once this returns no further frames reach the sink. Idempotent.
    pub async fn stop(&mut self) -> DeviceResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.token.cancel();
        let mut control = running
            .task
            .await
            .map_err(|e| DeviceError::Io(format!("capture task failed: {e}")))?;
        self.meter.reset();

        tracing::debug!(
            "Capture stopped ({} frames sent, {} dropped)",
            self.stats.frames_sent(),
            self.stats.frames_dropped()
        );

        tokio::task::spawn_blocking(move || control.release())
            .await
            .map_err(|e| DeviceError::Io(format!("microphone release failed: {e}")))?
    }
}
