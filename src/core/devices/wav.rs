//! WAV file devices (hound).
//!
//! [`WavFileMicrophone`] plays a recording into the session at real-time pace.
//! [`WavFileOutputProvider`] opens a device that renders everything the
//! session schedules onto a wall-clock timeline and writes it out on close.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    CaptureFormat, DeviceError, DeviceFaults, DeviceResult, MIC_BLOCK_QUEUE_CAPACITY,
    MicrophoneProvider, MicrophoneStream, OutputDevice, OutputDeviceProvider, PlaybackEnded,
    StreamControl, render_mono, resample_linear, samples_for, time_of_sample,
};
use crate::core::capture::append_downmixed_samples;
use crate::core::codec::{AudioFrame, PCM_SCALE};

fn map_io_error(path: &Path, e: std::io::Error) -> DeviceError {
    match e.kind() {
        ErrorKind::PermissionDenied => {
            DeviceError::PermissionDenied(format!("{}: {}", path.display(), e))
        }
        ErrorKind::NotFound => DeviceError::Unavailable(format!("{}: {}", path.display(), e)),
        _ => DeviceError::Io(format!("{}: {}", path.display(), e)),
    }
}

fn map_hound_error(path: &Path, e: hound::Error) -> DeviceError {
    match e {
        hound::Error::IoError(io) => map_io_error(path, io),
        other => DeviceError::UnsupportedFormat(format!("{}: {}", path.display(), other)),
    }
}

// =============================================================================
// Microphone
// =============================================================================

/// Microphone backed by a WAV file.
#[derive(Debug, Clone)]
pub struct WavFileMicrophone {
    path: PathBuf,
    pad_with_silence: bool,
    realtime: bool,
}

impl WavFileMicrophone {
    /// Real-time paced input that keeps delivering silence after the file ends.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pad_with_silence: true,
            realtime: true,
        }
    }

    /// When disabled, the end of the file ends the stream.
    pub fn pad_with_silence(mut self, pad: bool) -> Self {
        self.pad_with_silence = pad;
        self
    }

    /// When disabled, blocks are delivered as fast as they are consumed.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Read the whole file as mono samples at `target_rate`.
    pub fn load(path: &Path, target_rate: u32) -> DeviceResult<Vec<f32>> {
        let mut reader = hound::WavReader::open(path).map_err(|e| map_hound_error(path, e))?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let mut mono = Vec::with_capacity(reader.duration() as usize);
        match spec.sample_format {
            hound::SampleFormat::Float => {
                let samples = reader
                    .samples::<f32>()
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| map_hound_error(path, e))?;
                append_downmixed_samples(&mut mono, &samples, channels, |s| s);
            }
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                let samples = reader
                    .samples::<i32>()
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| map_hound_error(path, e))?;
                append_downmixed_samples(&mut mono, &samples, channels, |s| s as f32 / scale);
            }
        }

        tracing::debug!(
            "Loaded {} ({} Hz, {} channel(s), {} samples)",
            path.display(),
            spec.sample_rate,
            spec.channels,
            mono.len()
        );
        Ok(resample_linear(&mono, spec.sample_rate, target_rate))
    }
}

struct WavControl {
    token: CancellationToken,
}

impl StreamControl for WavControl {
    fn release(&mut self) -> DeviceResult<()> {
        self.token.cancel();
        Ok(())
    }
}

#[async_trait]
impl MicrophoneProvider for WavFileMicrophone {
    async fn request_access(&self) -> DeviceResult<()> {
        File::open(&self.path)
            .map(|_| ())
            .map_err(|e| map_io_error(&self.path, e))
    }

    async fn open(
        &self,
        format: CaptureFormat,
        _faults: DeviceFaults,
    ) -> DeviceResult<MicrophoneStream> {
        let path = self.path.clone();
        let rate = format.sample_rate;
        let samples = tokio::task::spawn_blocking(move || Self::load(&path, rate))
            .await
            .map_err(|e| DeviceError::Io(e.to_string()))??;

        let (tx, rx) = mpsc::channel(MIC_BLOCK_QUEUE_CAPACITY);
        let token = CancellationToken::new();
        let block = format.block_samples.max(1);
        let period = time_of_sample(block as u64, rate);
        let pad = self.pad_with_silence;
        let realtime = self.realtime;
        let cancel = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_micros(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut offset = 0;

            loop {
                if realtime {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                }

                let data = if offset < samples.len() {
                    let end = (offset + block).min(samples.len());
                    let data = samples[offset..end].to_vec();
                    offset = end;
                    data
                } else if pad {
                    vec![0.0; block]
                } else {
                    tracing::info!("WAV input finished");
                    break;
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(data) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(MicrophoneStream {
            sample_rate: rate,
            blocks: rx,
            control: Box::new(WavControl { token }),
        })
    }
}

// =============================================================================
// Output
// =============================================================================

struct PendingVoice {
    start_sample: u64,
    samples: Vec<f32>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Timeline {
    voices: HashMap<u64, PendingVoice>,
    mixed: Vec<f32>,
}

impl Timeline {
    fn mix(&mut self, start: u64, samples: &[f32]) {
        let start = start as usize;
        let end = start + samples.len();
        if self.mixed.len() < end {
            self.mixed.resize(end, 0.0);
        }
        for (out, sample) in self.mixed[start..end].iter_mut().zip(samples) {
            *out = (*out + sample).clamp(-1.0, 1.0);
        }
    }

    /// Mix the part of a voice heard before `cut_at` and discard the rest.
    fn truncate(&mut self, id: u64, cut_at: u64) {
        if let Some(voice) = self.voices.remove(&id) {
            voice.timer.abort();
            let heard = cut_at.saturating_sub(voice.start_sample) as usize;
            let heard = heard.min(voice.samples.len());
            self.mix(voice.start_sample, &voice.samples[..heard]);
        }
    }
}

struct WavOutputInner {
    path: PathBuf,
    sample_rate: u32,
    epoch: Instant,
    timeline: Mutex<Timeline>,
    writer: Mutex<Option<hound::WavWriter<BufWriter<File>>>>,
}

impl WavOutputInner {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Output device that records the playback timeline to a WAV file.
pub struct WavFileOutput {
    inner: Arc<WavOutputInner>,
}

impl WavFileOutput {
    pub fn create(path: impl Into<PathBuf>, sample_rate: u32) -> DeviceResult<Self> {
        let path = path.into();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec).map_err(|e| map_hound_error(&path, e))?;
        tracing::info!("Recording agent audio to {}", path.display());

        Ok(Self {
            inner: Arc::new(WavOutputInner {
                path,
                sample_rate,
                epoch: Instant::now(),
                timeline: Mutex::new(Timeline::default()),
                writer: Mutex::new(Some(writer)),
            }),
        })
    }
}

impl OutputDevice for WavFileOutput {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    fn current_time(&self) -> Duration {
        self.inner.now()
    }

    fn play_at(
        &self,
        id: u64,
        frame: AudioFrame,
        start_at: Duration,
        on_ended: PlaybackEnded,
    ) -> DeviceResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DeviceError::Unavailable(format!("no async runtime: {e}")))?;
        if self.inner.writer.lock().is_none() {
            return Err(DeviceError::Unavailable("output device closed".to_string()));
        }

        let rate = self.inner.sample_rate;
        let samples = render_mono(&frame, rate);
        let start = start_at.max(self.inner.now());
        let start_sample = samples_for(start, rate);
        let end = time_of_sample(start_sample + samples.len() as u64, rate);

        let inner = self.inner.clone();
        let mut timeline = self.inner.timeline.lock();
        let timer = runtime.spawn(async move {
            tokio::time::sleep_until(inner.epoch + end).await;
            let finished = {
                let mut timeline = inner.timeline.lock();
                match timeline.voices.remove(&id) {
                    Some(voice) => {
                        timeline.mix(voice.start_sample, &voice.samples);
                        true
                    }
                    None => false,
                }
            };
            if finished {
                on_ended();
            }
        });
        timeline.voices.insert(
            id,
            PendingVoice {
                start_sample,
                samples,
                timer,
            },
        );
        Ok(())
    }

    fn stop(&self, id: u64) {
        let cut_at = samples_for(self.inner.now(), self.inner.sample_rate);
        self.inner.timeline.lock().truncate(id, cut_at);
    }

    fn close(&self) -> DeviceResult<()> {
        let Some(mut writer) = self.inner.writer.lock().take() else {
            return Ok(());
        };

        let cut_at = samples_for(self.inner.now(), self.inner.sample_rate);
        let mixed = {
            let mut timeline = self.inner.timeline.lock();
            let ids: Vec<u64> = timeline.voices.keys().copied().collect();
            for id in ids {
                timeline.truncate(id, cut_at);
            }
            std::mem::take(&mut timeline.mixed)
        };

        let path = &self.inner.path;
        for sample in &mixed {
            let value = (sample * PCM_SCALE)
                .round()
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer
                .write_sample(value)
                .map_err(|e| map_hound_error(path, e))?;
        }
        writer.finalize().map_err(|e| map_hound_error(path, e))?;

        tracing::info!(
            "Wrote {:.2}s of agent audio to {}",
            mixed.len() as f64 / self.inner.sample_rate.max(1) as f64,
            path.display()
        );
        Ok(())
    }
}

/// Opens a [`WavFileOutput`] at a fixed path.
#[derive(Debug, Clone)]
pub struct WavFileOutputProvider {
    path: PathBuf,
}

impl WavFileOutputProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl OutputDeviceProvider for WavFileOutputProvider {
    async fn open(
        &self,
        sample_rate: u32,
        _faults: DeviceFaults,
    ) -> DeviceResult<Arc<dyn OutputDevice>> {
        Ok(Arc::new(WavFileOutput::create(self.path.clone(), sample_rate)?))
    }
}
