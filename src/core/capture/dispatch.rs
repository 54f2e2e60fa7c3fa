use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::meter::{LoudnessMeter, rms};
use crate::core::codec;
use crate::core::transport::{ChunkSender, SendOutcome};

/// Downmix interleaved multi-channel input to mono, applying `convert` to each
/// raw sample so devices of any layout feed a single channel.
pub(crate) fn append_downmixed_samples<T, F>(
    buf: &mut Vec<f32>,
    data: &[T],
    channels: usize,
    mut convert: F,
) where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

/// Counters describing capture throughput.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    codec_errors: AtomicU64,
}

impl CaptureStats {
    /// Frames accepted by the transport send queue.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames discarded because the send queue was full.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Frames discarded because they could not be encoded.
    pub fn codec_errors(&self) -> u64 {
        self.codec_errors.load(Ordering::Relaxed)
    }
}

/// Slices incoming sample blocks into fixed-size frames, meters them, encodes
/// them and hands them to the transport without waiting.
pub(crate) struct FrameDispatcher {
    frame_samples: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    sink: ChunkSender,
    meter: LoudnessMeter,
    stats: Arc<CaptureStats>,
}

impl FrameDispatcher {
    pub(crate) fn new(
        frame_samples: usize,
        sample_rate: u32,
        sink: ChunkSender,
        meter: LoudnessMeter,
        stats: Arc<CaptureStats>,
    ) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            sample_rate,
            pending: Vec::with_capacity(frame_samples * 2),
            sink,
            meter,
            stats,
        }
    }

    /// Accept one block of mono samples. Returns the number of complete frames
    /// that were dispatched.
    pub(crate) fn push(&mut self, block: &[f32]) -> usize {
        self.pending.extend_from_slice(block);

        let mut dispatched = 0;
        while self.pending.len() >= self.frame_samples {
            let frame: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            let chunk = match codec::encode_f32(&frame, self.sample_rate, 1) {
                Ok(chunk) => {
                    self.meter.set_level(rms(&frame));
                    chunk
                }
                Err(e) => {
                    self.stats.codec_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Dropping captured frame: {}", e);
                    continue;
                }
            };

            match self.sink.send(chunk) {
                SendOutcome::Queued => {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                SendOutcome::QueueFull => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
                SendOutcome::Closed => {}
            }
            dispatched += 1;
        }
        dispatched
    }

    /// Discard any partial frame.
    pub(crate) fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn dispatcher(frame_samples: usize, capacity: usize) -> (FrameDispatcher, mpsc::Receiver<codec::EncodedChunk>, Arc<CaptureStats>) {
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(CaptureStats::default());
        let sink = ChunkSender::new(tx);
        let d = FrameDispatcher::new(frame_samples, 16000, sink, LoudnessMeter::new(), stats.clone());
        (d, rx, stats)
    }

    #[test]
    fn test_downmix_stereo_to_mono() {
        let mut buf = Vec::new();
        append_downmixed_samples(&mut buf, &[0.2f32, 0.4, -0.2, -0.4], 2, |s| s);
        assert_eq!(buf.len(), 2);
        assert!((buf[0] - 0.3).abs() < 1e-6);
        assert!((buf[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_converts_integer_samples() {
        let mut buf = Vec::new();
        append_downmixed_samples(&mut buf, &[16384i16, -16384], 1, |s| s as f32 / 32768.0);
        assert_eq!(buf, vec![0.5, -0.5]);
    }

    #[test]
    fn test_frames_are_fixed_size() {
        let (mut d, mut rx, stats) = dispatcher(4, 16);

        assert_eq!(d.push(&[0.1; 3]), 0);
        assert_eq!(d.push(&[0.1; 6]), 2);
        assert_eq!(stats.frames_sent(), 2);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.len(), 8);
        assert_eq!(first.mime_type, "audio/pcm;rate=16000");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (mut d, _rx, stats) = dispatcher(2, 1);
        assert_eq!(d.push(&[0.0; 6]), 3);
        assert_eq!(stats.frames_sent(), 1);
        assert_eq!(stats.frames_dropped(), 2);
    }

    #[test]
    fn test_non_finite_frame_is_dropped() {
        let (mut d, mut rx, stats) = dispatcher(2, 4);
        d.push(&[f32::NAN, 0.0, 0.25, 0.25]);
        assert_eq!(stats.codec_errors(), 1);
        assert_eq!(stats.frames_sent(), 1);
        assert_eq!(rx.try_recv().unwrap().len(), 4);
    }

    #[test]
    fn test_meter_tracks_last_frame() {
        let (tx, _rx) = mpsc::channel(8);
        let meter = LoudnessMeter::new();
        let mut d = FrameDispatcher::new(
            2,
            16000,
            ChunkSender::new(tx),
            meter.clone(),
            Arc::new(CaptureStats::default()),
        );
        d.push(&[0.5, -0.5]);
        assert_eq!(meter.level(), 0.5);
        d.push(&[0.0, 0.0]);
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_meter_ignores_rejected_frame() {
        let (tx, _rx) = mpsc::channel(8);
        let meter = LoudnessMeter::new();
        let mut d = FrameDispatcher::new(
            2,
            16000,
            ChunkSender::new(tx),
            meter.clone(),
            Arc::new(CaptureStats::default()),
        );
        d.push(&[0.5, -0.5]);
        d.push(&[f32::NAN, 0.0]);
        assert_eq!(meter.level(), 0.5);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let (mut d, _rx, _stats) = dispatcher(4, 4);
        d.push(&[0.1; 3]);
        d.reset();
        assert_eq!(d.push(&[0.1; 3]), 0);
    }
}
