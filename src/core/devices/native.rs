//! System audio devices through cpal.
//!
//! cpal streams are not `Send`, so each open stream lives on its own thread
//! that holds it until release. Input callbacks downmix, resample and hand
//! blocks off with `try_send`; the output callback mixes scheduled voices and
//! counts rendered frames, which is the device clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::{
    CaptureFormat, DeviceError, DeviceFaults, DeviceResult, MIC_BLOCK_QUEUE_CAPACITY,
    MicrophoneProvider, MicrophoneStream, OutputDevice, OutputDeviceProvider, PlaybackEnded,
    StreamControl, render_mono, resample_linear, samples_for, time_of_sample,
};
use crate::core::capture::append_downmixed_samples;
use crate::core::codec::AudioFrame;

/// Names of the available input and output devices.
pub fn list_devices() -> DeviceResult<Vec<String>> {
    let host = cpal::default_host();
    let mut lines = Vec::new();

    let inputs = host
        .input_devices()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
    for device in inputs {
        lines.push(format!(
            "input:  {}",
            device.name().unwrap_or_else(|_| "Unknown Device".to_string())
        ));
    }

    let outputs = host
        .output_devices()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
    for device in outputs {
        lines.push(format!(
            "output: {}",
            device.name().unwrap_or_else(|_| "Unknown Device".to_string())
        ));
    }
    Ok(lines)
}

fn find_input(name: Option<&str>) -> DeviceResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::Unavailable(format!("input device '{name}' not found"))),
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceError::Unavailable("no default input device".to_string())),
    }
}

fn map_build_error(e: cpal::BuildStreamError) -> DeviceError {
    let message = e.to_string();
    if message.to_lowercase().contains("permission") {
        DeviceError::PermissionDenied(message)
    } else {
        DeviceError::Unavailable(message)
    }
}

/// Runs `build` on a dedicated thread that keeps the resulting stream alive
/// until the returned stop sender fires or is dropped.
async fn spawn_stream_thread<F, R>(
    name: &str,
    build: F,
) -> DeviceResult<(R, StreamThread)>
where
    F: FnOnce() -> DeviceResult<(cpal::Stream, R)> + Send + 'static,
    R: Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let (stream, value) = match build() {
                Ok(built) => built,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(DeviceError::Unavailable(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(value));
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| DeviceError::Io(e.to_string()))?;

    let thread = StreamThread {
        stop_tx: Some(stop_tx),
        handle: Some(handle),
    };
    match ready_rx.await {
        Ok(Ok(value)) => Ok((value, thread)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DeviceError::Unavailable("audio thread exited".to_string())),
    }
}

struct StreamThread {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn shutdown(&mut self) -> DeviceResult<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| DeviceError::Io("audio thread panicked".to_string()))?;
        }
        Ok(())
    }
}

// =============================================================================
// Microphone
// =============================================================================

/// The system microphone.
#[derive(Debug, Clone, Default)]
pub struct NativeMicrophone {
    device_name: Option<String>,
}

impl NativeMicrophone {
    /// Use the default input device, or the named one.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_input<T, F>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    device_rate: u32,
    target_rate: u32,
    tx: mpsc::Sender<Vec<f32>>,
    faults: DeviceFaults,
    convert: F,
) -> DeviceResult<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    F: Fn(T) -> f32 + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut mono = Vec::with_capacity(data.len() / channels.max(1));
                append_downmixed_samples(&mut mono, data, channels, &convert);
                let _ = tx.try_send(resample_linear(&mono, device_rate, target_rate));
            },
            move |err| {
                tracing::error!("Audio input stream error: {}", err);
                let _ = faults.send(DeviceError::Unavailable(err.to_string()));
            },
            None,
        )
        .map_err(map_build_error)
}

struct NativeControl {
    thread: StreamThread,
}

impl StreamControl for NativeControl {
    fn release(&mut self) -> DeviceResult<()> {
        self.thread.shutdown()
    }
}

#[async_trait]
impl MicrophoneProvider for NativeMicrophone {
    async fn request_access(&self) -> DeviceResult<()> {
        let device = find_input(self.device_name.as_deref())?;
        device
            .default_input_config()
            .map(|_| ())
            .map_err(|e| DeviceError::PermissionDenied(e.to_string()))
    }

    async fn open(
        &self,
        format: CaptureFormat,
        faults: DeviceFaults,
    ) -> DeviceResult<MicrophoneStream> {
        let (tx, rx) = mpsc::channel(MIC_BLOCK_QUEUE_CAPACITY);
        let device_name = self.device_name.clone();
        let target_rate = format.sample_rate;

        let ((), thread) = spawn_stream_thread("waav-live-capture", move || {
            let device = find_input(device_name.as_deref())?;
            let default_config = device
                .default_input_config()
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
            let sample_format = default_config.sample_format();
            let config: StreamConfig = default_config.into();
            let device_rate = config.sample_rate.0;
            let channels = usize::from(config.channels.max(1));

            tracing::info!(
                "Capture device: {} ({:?}, {} Hz, {} channel(s))",
                device.name().unwrap_or_else(|_| "Unknown Device".to_string()),
                sample_format,
                device_rate,
                channels
            );

            let stream = match sample_format {
                SampleFormat::F32 => build_input(
                    &device, &config, channels, device_rate, target_rate, tx, faults,
                    |s: f32| s,
                ),
                SampleFormat::I16 => build_input(
                    &device, &config, channels, device_rate, target_rate, tx, faults,
                    |s: i16| s as f32 / 32_768.0,
                ),
                SampleFormat::U16 => build_input(
                    &device, &config, channels, device_rate, target_rate, tx, faults,
                    |s: u16| (s as f32 - 32_768.0) / 32_768.0,
                ),
                other => Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
            }?;
            Ok((stream, ()))
        })
        .await?;

        Ok(MicrophoneStream {
            sample_rate: target_rate,
            blocks: rx,
            control: Box::new(NativeControl { thread }),
        })
    }
}

// =============================================================================
// Output
// =============================================================================

struct MixVoice {
    start_sample: u64,
    samples: Vec<f32>,
    position: usize,
    on_ended: Option<PlaybackEnded>,
}

struct OutputShared {
    sample_rate: u32,
    rendered: AtomicU64,
    voices: Mutex<BTreeMap<u64, MixVoice>>,
}

impl OutputShared {
    /// Fill one callback buffer. Returns callbacks of voices that finished.
    fn render<T>(&self, data: &mut [T], channels: usize) -> Vec<PlaybackEnded>
    where
        T: SizedSample + FromSample<f32>,
    {
        let frames = data.len() / channels.max(1);
        let base = self.rendered.load(Ordering::Acquire);
        let mut finished = Vec::new();

        {
            let mut voices = self.voices.lock();
            for (frame_index, out) in data.chunks_mut(channels.max(1)).enumerate() {
                let now = base + frame_index as u64;
                let mut mixed = 0.0f32;
                for voice in voices.values_mut() {
                    if voice.start_sample <= now && voice.position < voice.samples.len() {
                        mixed += voice.samples[voice.position];
                        voice.position += 1;
                    }
                }
                let value = <T as Sample>::from_sample(mixed.clamp(-1.0, 1.0));
                out.iter_mut().for_each(|s| *s = value);
            }

            let done: Vec<u64> = voices
                .iter()
                .filter(|(_, v)| v.position >= v.samples.len())
                .map(|(id, _)| *id)
                .collect();
            for id in done {
                if let Some(mut voice) = voices.remove(&id)
                    && let Some(on_ended) = voice.on_ended.take()
                {
                    finished.push(on_ended);
                }
            }
        }

        self.rendered.store(base + frames as u64, Ordering::Release);
        finished
    }
}

/// Output device context on the default system output.
pub struct NativeOutput {
    shared: Arc<OutputShared>,
    thread: Mutex<StreamThread>,
}

impl OutputDevice for NativeOutput {
    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn current_time(&self) -> Duration {
        time_of_sample(self.shared.rendered.load(Ordering::Acquire), self.shared.sample_rate)
    }

    fn play_at(
        &self,
        id: u64,
        frame: AudioFrame,
        start_at: Duration,
        on_ended: PlaybackEnded,
    ) -> DeviceResult<()> {
        let samples = render_mono(&frame, self.shared.sample_rate);
        let start_sample = samples_for(start_at, self.shared.sample_rate);
        self.shared.voices.lock().insert(
            id,
            MixVoice {
                start_sample,
                samples,
                position: 0,
                on_ended: Some(on_ended),
            },
        );
        Ok(())
    }

    fn stop(&self, id: u64) {
        self.shared.voices.lock().remove(&id);
    }

    fn close(&self) -> DeviceResult<()> {
        self.shared.voices.lock().clear();
        self.thread.lock().shutdown()
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<OutputShared>,
    faults: DeviceFaults,
) -> DeviceResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = usize::from(config.channels.max(1));
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for on_ended in shared.render(data, channels) {
                    on_ended();
                }
            },
            move |err| {
                tracing::error!("Audio output stream error: {}", err);
                let _ = faults.send(DeviceError::Unavailable(err.to_string()));
            },
            None,
        )
        .map_err(map_build_error)
}

/// Opens the default system output.
#[derive(Debug, Clone, Default)]
pub struct NativeOutputProvider;

#[async_trait]
impl OutputDeviceProvider for NativeOutputProvider {
    async fn open(
        &self,
        _sample_rate: u32,
        faults: DeviceFaults,
    ) -> DeviceResult<Arc<dyn OutputDevice>> {
        let (shared, thread) = spawn_stream_thread("waav-live-playback", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| DeviceError::Unavailable("no default output device".to_string()))?;
            let default_config = device
                .default_output_config()
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
            let sample_format = default_config.sample_format();
            let config: StreamConfig = default_config.into();

            let shared = Arc::new(OutputShared {
                sample_rate: config.sample_rate.0,
                rendered: AtomicU64::new(0),
                voices: Mutex::new(BTreeMap::new()),
            });

            tracing::info!(
                "Playback device: {} ({:?}, {} Hz)",
                device.name().unwrap_or_else(|_| "Unknown Device".to_string()),
                sample_format,
                config.sample_rate.0
            );
            let stream_shared = shared.clone();
            let stream = match sample_format {
                SampleFormat::F32 => build_output::<f32>(&device, &config, stream_shared, faults),
                SampleFormat::I16 => build_output::<i16>(&device, &config, stream_shared, faults),
                SampleFormat::U16 => build_output::<u16>(&device, &config, stream_shared, faults),
                other => Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
            }?;
            Ok((stream, shared))
        })
        .await?;

        Ok(Arc::new(NativeOutput {
            shared,
            thread: Mutex::new(thread),
        }))
    }
}
