//! Frequency-domain loudness
//!
//! Levels are the average of per-bin magnitudes, each converted to dB and
//! mapped from [-90 dB, -10 dB] onto [0, 1]. A tone concentrated in a few
//! bins therefore reads much quieter than broadband speech of the same power.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Samples per analysis frame
pub const FFT_SIZE: usize = 256;

/// Default weight given to the previous frame
pub const DEFAULT_SMOOTHING: f32 = 0.85;

/// Bin magnitude mapped to 0.0
const MIN_DB: f32 = -90.0;

/// Bin magnitude mapped to 1.0
const MAX_DB: f32 = -10.0;

/// Blackman-windowed FFT with per-bin temporal smoothing
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothing: f32,
    magnitudes: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl std::fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("smoothing", &self.smoothing)
            .finish_non_exhaustive()
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING)
    }
}

impl SpectrumAnalyzer {
    /// Analyzer blending each frame with `smoothing` of the previous one
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(smoothing: f32) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(FFT_SIZE);
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = 2.0 * PI * i as f32 / FFT_SIZE as f32;
                0.08f32.mul_add((2.0 * x).cos(), 0.5f32.mul_add(-x.cos(), 0.42))
            })
            .collect();

        Self {
            fft,
            window,
            smoothing: smoothing.clamp(0.0, 1.0),
            magnitudes: vec![0.0; FFT_SIZE / 2],
            scratch: vec![Complex::new(0.0, 0.0); FFT_SIZE],
        }
    }

    /// Normalized level (0-1) of the most recent `FFT_SIZE` samples
    ///
    /// Shorter input is padded with leading silence.
    #[allow(clippy::cast_precision_loss)]
    pub fn level(&mut self, samples: &[f32]) -> f32 {
        let tail = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        let offset = FFT_SIZE - tail.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < offset { 0.0 } else { tail[i - offset] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let mut total = 0.0;
        for (bin, smoothed) in self.scratch.iter().zip(self.magnitudes.iter_mut()) {
            let magnitude = bin.norm() / FFT_SIZE as f32;
            *smoothed = self.smoothing.mul_add(*smoothed, (1.0 - self.smoothing) * magnitude);
            total += bin_level(*smoothed);
        }
        total / self.magnitudes.len() as f32
    }

    /// Forget the smoothing history
    pub fn reset(&mut self) {
        self.magnitudes.fill(0.0);
    }
}

fn bin_level(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    ((db - MIN_DB) / (MAX_DB - MIN_DB)).clamp(0.0, 1.0)
}

/// Unsmoothed normalized level (0-1) of a block of samples
#[must_use]
pub fn normalized_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    SpectrumAnalyzer::new(0.0).level(samples)
}
