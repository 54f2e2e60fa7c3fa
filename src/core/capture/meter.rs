use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Instantaneous microphone loudness shared with the host UI.
///
/// Holds the RMS of the most recent captured frame as raw `f32` bits so the
/// capture task can publish without locking.
#[derive(Clone, Debug)]
pub struct LoudnessMeter {
    level_bits: Arc<AtomicU32>,
}

impl LoudnessMeter {
    pub fn new() -> Self {
        Self {
            level_bits: Arc::new(AtomicU32::new(0.0f32.to_bits())),
        }
    }

    pub fn set_level(&self, level: f32) {
        self.level_bits.store(level.to_bits(), Ordering::Relaxed);
    }

    /// Last published RMS level in `[0.0, 1.0]`.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.set_level(0.0);
    }
}

impl Default for LoudnessMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Root mean square of a block of samples, `sqrt(mean(x²))`.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    energy.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_defaults_to_silence() {
        let meter = LoudnessMeter::new();
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_meter_shared_between_clones() {
        let meter = LoudnessMeter::new();
        let observer = meter.clone();
        meter.set_level(0.42);
        assert_eq!(observer.level(), 0.42);
        meter.reset();
        assert_eq!(observer.level(), 0.0);
    }

    #[test]
    fn test_rms_values() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.5, -0.5, 0.5, -0.5]), 0.5);
        let value = rms(&[1.0, 0.0]);
        assert!((value - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }
}
