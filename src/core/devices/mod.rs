//! Audio device abstractions.
//!
//! The session never touches hardware directly. It acquires a microphone
//! stream from a [`MicrophoneProvider`] and an output clock from an
//! [`OutputDeviceProvider`] on entry to `Active`, and releases both on exit.
//!
//! # Backends
//!
//! - `manual` - Hand-driven devices with a manual clock, for tests
//! - `wav` - WAV file input and output (hound)
//! - `native` - System audio through cpal (feature `native-audio`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::codec::AudioFrame;

pub mod manual;
#[cfg(feature = "native-audio")]
pub mod native;
pub mod wav;

pub use manual::{ManualMicrophone, ManualOutput, ManualOutputProvider, ScheduledPlay};
#[cfg(feature = "native-audio")]
pub use native::{NativeMicrophone, NativeOutputProvider, list_devices};
pub use wav::{WavFileMicrophone, WavFileOutputProvider};

/// Default capacity of a microphone block queue.
pub const MIC_BLOCK_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by audio devices. All are fatal to an active session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Microphone access was refused
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable device, or the device disappeared
    #[error("Audio device unavailable: {0}")]
    Unavailable(String),

    /// The capture stream stopped delivering audio
    #[error("Audio stream ended: {0}")]
    StreamEnded(String),

    /// The device cannot provide the requested format
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Reading or writing audio failed
    #[error("Audio I/O error: {0}")]
    Io(String),
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Channel on which devices report asynchronous failures to the session.
pub type DeviceFaults = mpsc::UnboundedSender<DeviceError>;

/// Invoked once when a scheduled buffer finishes playing naturally.
pub type PlaybackEnded = Box<dyn FnOnce() + Send + 'static>;

// =============================================================================
// Microphone
// =============================================================================

/// Requested microphone format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Rate the session encodes at; backends resample to it
    pub sample_rate: u32,
    /// Preferred number of samples per delivered block
    pub block_samples: usize,
}

/// Releases the underlying capture device.
pub trait StreamControl: Send {
    /// Stop the device. Called at most once.
    fn release(&mut self) -> DeviceResult<()>;
}

/// An open microphone: mono `f32` blocks at `sample_rate`.
///
/// The device callback feeds `blocks` with `try_send`, so a slow consumer
/// loses blocks instead of stalling the audio thread. The channel closing
/// means the device stream ended.
pub struct MicrophoneStream {
    pub sample_rate: u32,
    pub blocks: mpsc::Receiver<Vec<f32>>,
    pub control: Box<dyn StreamControl>,
}

impl std::fmt::Debug for MicrophoneStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneStream")
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

/// Source of microphone streams.
#[async_trait]
pub trait MicrophoneProvider: Send + Sync {
    /// Ask for permission to record. Called while the session is connecting.
    async fn request_access(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// Open the microphone.
    async fn open(&self, format: CaptureFormat, faults: DeviceFaults)
    -> DeviceResult<MicrophoneStream>;
}

// =============================================================================
// Output
// =============================================================================

/// An output device context with its own clock.
///
/// Times are offsets on the device clock, which starts when the context is
/// opened and only moves forward.
pub trait OutputDevice: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Current position of the output clock.
    fn current_time(&self) -> Duration;

    /// Schedule `frame` to begin at `start_at`. A start time in the past
    /// plays immediately. `on_ended` fires when playback completes, but not
    /// when the buffer is stopped.
    fn play_at(
        &self,
        id: u64,
        frame: AudioFrame,
        start_at: Duration,
        on_ended: PlaybackEnded,
    ) -> DeviceResult<()>;

    /// Stop a scheduled or playing buffer immediately. Unknown ids are ignored.
    fn stop(&self, id: u64);

    /// Release the device. Pending buffers are discarded.
    fn close(&self) -> DeviceResult<()>;
}

/// Source of output device contexts.
#[async_trait]
pub trait OutputDeviceProvider: Send + Sync {
    async fn open(&self, sample_rate: u32, faults: DeviceFaults)
    -> DeviceResult<Arc<dyn OutputDevice>>;
}

// =============================================================================
// Helpers
// =============================================================================

/// Linear resampling between arbitrary rates.
pub(crate) fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || to_rate == 0 || from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (input.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src = i as f64 / ratio;
        let idx = src.floor() as usize;
        let frac = (src - idx as f64) as f32;
        let sample = match (input.get(idx), input.get(idx + 1)) {
            (Some(&a), Some(&b)) => a * (1.0 - frac) + b * frac,
            (Some(&a), None) => a,
            _ => input[input.len() - 1],
        };
        output.push(sample);
    }
    output
}

/// Mono float samples of `frame` at `device_rate`, averaging channels and
/// resampling when the frame was produced at another rate.
pub(crate) fn render_mono(frame: &AudioFrame, device_rate: u32) -> Vec<f32> {
    let mono = if frame.channels() <= 1 {
        frame.to_f32()
    } else {
        let planes = frame.channel_data();
        let count = planes.len() as f32;
        (0..frame.frame_count())
            .map(|i| planes.iter().map(|p| p[i]).sum::<f32>() / count)
            .collect()
    };
    resample_linear(&mono, frame.sample_rate(), device_rate)
}

/// Sample count covering `duration` at `sample_rate`, rounded down.
pub(crate) fn samples_for(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}

/// Position of sample `index` on a clock running at `sample_rate`.
pub(crate) fn time_of_sample(index: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((index as u128 * 1_000_000_000 / sample_rate as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 16000, 16000), input);
    }

    #[test]
    fn test_resample_changes_length() {
        let input = vec![0.0f32; 480];
        assert_eq!(resample_linear(&input, 48000, 16000).len(), 160);
        assert_eq!(resample_linear(&input, 16000, 24000).len(), 720);
    }

    #[test]
    fn test_resample_interpolates() {
        let out = resample_linear(&[0.0, 1.0], 1000, 2000);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert_eq!(out[2], 1.0);
    }

    #[test]
    fn test_render_mono_averages_channels() {
        let frame = AudioFrame::from_planar(&[&[0.5, 0.25], &[0.0, 0.25]], 24000).unwrap();
        assert_eq!(render_mono(&frame, 24000), vec![0.25, 0.25]);
    }

    #[test]
    fn test_sample_time_conversions() {
        assert_eq!(samples_for(Duration::from_millis(100), 24000), 2400);
        assert_eq!(time_of_sample(2400, 24000), Duration::from_millis(100));
        assert_eq!(time_of_sample(5, 0), Duration::ZERO);
    }

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::PermissionDenied("blocked".to_string());
        assert_eq!(err.to_string(), "Microphone permission denied: blocked");
    }
}
