//! Audio Test Fixtures
//!
//! Generated audio keeps inputs reproducible and free of external files.
//!
//! Audio formats:
//! - Capture: 16kHz mono, f32 blocks as a microphone delivers them
//! - Playback: 24kHz mono, 16-bit signed little-endian PCM as the agent sends it

use std::f32::consts::PI;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;

/// Capture sample rate (16kHz)
pub const CAPTURE_RATE: u32 = 16000;

/// Playback sample rate (24kHz)
pub const PLAYBACK_RATE: u32 = 24000;

/// Number of samples covering `duration` at `rate`
pub fn samples_for(duration: Duration, rate: u32) -> usize {
    (duration.as_nanos() * rate as u128 / 1_000_000_000) as usize
}

/// Generate a sine wave tone as f32 samples in [-1, 1]
pub fn sine_f32(duration_samples: usize, frequency: f32, amplitude: f32, rate: u32) -> Vec<f32> {
    let angular_freq = 2.0 * PI * frequency / rate as f32;
    (0..duration_samples)
        .map(|i| (angular_freq * i as f32).sin() * amplitude)
        .collect()
}

/// Generate a sine wave tone as PCM16 samples
pub fn sine_i16(duration_samples: usize, frequency: f32, amplitude: f32, rate: u32) -> Vec<i16> {
    sine_f32(duration_samples, frequency, amplitude, rate)
        .into_iter()
        .map(|s| (s * i16::MAX as f32) as i16)
        .collect()
}

/// Constant-amplitude microphone block (RMS equals `level`)
pub fn mic_block(duration_samples: usize, level: f32) -> Vec<f32> {
    vec![level; duration_samples]
}

/// Convert samples to little-endian bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Convert little-endian bytes to samples
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Agent audio delta of the given length: a 440Hz tone at the playback rate
pub fn agent_audio(duration: Duration) -> Bytes {
    let samples = sine_i16(samples_for(duration, PLAYBACK_RATE), 440.0, 0.5, PLAYBACK_RATE);
    Bytes::from(samples_to_bytes(&samples))
}

/// Calculate RMS of PCM16 samples, normalized to [0, 1]
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let x = s as f64 / 32768.0;
            x * x
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Write a 16-bit WAV file with the given channel layout
pub fn write_wav(path: &Path, samples: &[i16], rate: u32, channels: u16) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &sample in samples {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
}

/// Read every sample of a 16-bit WAV file
pub fn read_wav(path: &Path) -> (hound::WavSpec, Vec<i16>) {
    let mut reader = hound::WavReader::open(path).unwrap();
    let spec = reader.spec();
    let samples = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    (spec, samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_for() {
        assert_eq!(samples_for(Duration::from_millis(40), PLAYBACK_RATE), 960);
        assert_eq!(samples_for(Duration::from_millis(32), CAPTURE_RATE), 512);
    }

    #[test]
    fn test_agent_audio_length() {
        let audio = agent_audio(Duration::from_millis(100));
        assert_eq!(audio.len(), 2400 * 2);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        assert_eq!(bytes_to_samples(&samples_to_bytes(&samples)), samples);
    }

    #[test]
    fn test_sine_rms() {
        let tone = sine_i16(PLAYBACK_RATE as usize, 440.0, 0.5, PLAYBACK_RATE);
        let rms = calculate_rms(&tone);
        // RMS of a sine is amplitude / sqrt(2)
        assert!((rms - 0.3535).abs() < 0.01);
    }
}
