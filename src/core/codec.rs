//! PCM codec for the live voice channel.
//!
//! Converts between floating-point samples in `[-1.0, 1.0]` and the 16-bit
//! signed little-endian wire representation used in both directions.
//!
//! # Audio Format
//!
//! - Capture: PCM 16-bit, 16kHz, mono, tagged `audio/pcm;rate=16000`
//! - Playback: PCM 16-bit, 24kHz, mono
//!
//! Multi-channel frames are interleaved on the wire, one full sample group
//! per frame position.

use std::time::Duration;

use base64::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Scale factor between float samples and 16-bit integers.
pub const PCM_SCALE: f32 = 32768.0;

/// Default microphone sample rate.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Default agent speech sample rate.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Bytes per 16-bit sample.
const BYTES_PER_SAMPLE: usize = 2;

// =============================================================================
// Error Types
// =============================================================================

/// Errors produced while converting audio. Always recoverable: the offending
/// frame is dropped and the session continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// Payload length does not divide into whole sample groups
    #[error("Malformed PCM payload: {len} bytes is not a multiple of {group_bytes} ({channels} channel(s))")]
    MalformedLength {
        len: usize,
        channels: u16,
        group_bytes: usize,
    },

    /// NaN or infinite input sample
    #[error("Non-finite sample at index {index}")]
    NonFiniteSample { index: usize },

    /// Zero channels, or planar input with mismatched lengths
    #[error("Invalid channel layout: {0}")]
    InvalidChannelLayout(String),

    /// Base64 transport encoding could not be decoded
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

// =============================================================================
// Data Types
// =============================================================================

/// A block of 16-bit samples tagged with its rate and channel count.
///
/// Samples are stored interleaved. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Build a frame from already-quantized interleaved samples.
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> CodecResult<Self> {
        if channels == 0 {
            return Err(CodecError::InvalidChannelLayout(
                "channel count must be at least 1".to_string(),
            ));
        }
        if samples.len() % channels as usize != 0 {
            return Err(CodecError::InvalidChannelLayout(format!(
                "{} samples cannot be split across {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Quantize interleaved float samples into a frame.
    pub fn from_f32(samples: &[f32], sample_rate: u32, channels: u16) -> CodecResult<Self> {
        let mut quantized = Vec::with_capacity(samples.len());
        for (index, &sample) in samples.iter().enumerate() {
            quantized.push(quantize(sample, index)?);
        }
        Self::new(quantized, sample_rate, channels)
    }

    /// Quantize per-channel float arrays, interleaving them.
    pub fn from_planar(channels: &[&[f32]], sample_rate: u32) -> CodecResult<Self> {
        let Some(first) = channels.first() else {
            return Err(CodecError::InvalidChannelLayout(
                "no channels supplied".to_string(),
            ));
        };
        let frames = first.len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(CodecError::InvalidChannelLayout(
                "channels have different lengths".to_string(),
            ));
        }

        let count = channels.len();
        let mut quantized = Vec::with_capacity(frames * count);
        for position in 0..frames {
            for (channel, data) in channels.iter().enumerate() {
                quantized.push(quantize(data[position], position * count + channel)?);
            }
        }
        Self::new(quantized, sample_rate, count as u16)
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample groups (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length of the frame at its sample rate.
    ///
    /// Computed in whole nanoseconds so consecutive durations add up exactly
    /// for rates that divide one second evenly.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frame_count() as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Interleaved samples rescaled to `[-1.0, 1.0)`.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / PCM_SCALE).collect()
    }

    /// De-interleave into one float array per channel, each of
    /// `total_samples / channel_count` entries.
    pub fn channel_data(&self) -> Vec<Vec<f32>> {
        let count = self.channels as usize;
        let mut planes = vec![Vec::with_capacity(self.frame_count()); count];
        for group in self.samples.chunks_exact(count) {
            for (plane, &sample) in planes.iter_mut().zip(group) {
                plane.push(sample as f32 / PCM_SCALE);
            }
        }
        planes
    }
}

/// Wire form of an [`AudioFrame`]: little-endian bytes plus a MIME-like tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Raw PCM bytes (16-bit, little-endian, interleaved)
    pub data: Bytes,
    /// Format tag, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
}

impl EncodedChunk {
    /// Base64 text for JSON transports.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// MIME tag for raw PCM at the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

// =============================================================================
// Encode / Decode
// =============================================================================

#[inline]
fn quantize(sample: f32, index: usize) -> CodecResult<i16> {
    if !sample.is_finite() {
        return Err(CodecError::NonFiniteSample { index });
    }
    Ok((sample * PCM_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16)
}

/// Encode a frame into its wire form.
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    let mut buf = BytesMut::with_capacity(frame.samples.len() * BYTES_PER_SAMPLE);
    for &sample in &frame.samples {
        buf.put_i16_le(sample);
    }
    EncodedChunk {
        data: buf.freeze(),
        mime_type: pcm_mime_type(frame.sample_rate),
    }
}

/// Quantize and encode interleaved float samples in one step.
pub fn encode_f32(samples: &[f32], sample_rate: u32, channels: u16) -> CodecResult<EncodedChunk> {
    let frame = AudioFrame::from_f32(samples, sample_rate, channels)?;
    Ok(encode(&frame))
}

/// Decode little-endian PCM bytes into a frame.
pub fn decode(data: &[u8], sample_rate: u32, channels: u16) -> CodecResult<AudioFrame> {
    if channels == 0 {
        return Err(CodecError::InvalidChannelLayout(
            "channel count must be at least 1".to_string(),
        ));
    }
    let group_bytes = BYTES_PER_SAMPLE * channels as usize;
    if data.len() % group_bytes != 0 {
        return Err(CodecError::MalformedLength {
            len: data.len(),
            channels,
            group_bytes,
        });
    }

    let samples = data
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    AudioFrame::new(samples, sample_rate, channels)
}

/// Decode a base64 payload into a frame.
pub fn decode_base64(data: &str, sample_rate: u32, channels: u16) -> CodecResult<AudioFrame> {
    let bytes = BASE64_STANDARD
        .decode(data)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    decode(&bytes, sample_rate, channels)
}

// =============================================================================
// Tests
// =============================================================================
