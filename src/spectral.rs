//! FFT band power and freeze index.
//!
//! Band edges are converted to bins with `trunc(hz / bin_width)` where
//! `bin_width = sample_rate / window_len`, and a band sums bins `low..=high`.
//! With the default 100-sample window at 50 Hz that is bins 1..=6 for locomotion
//! (0.5–3 Hz) and 6..=16 for freeze (3–8 Hz); the 3 Hz bin belongs to both.

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandLimits {
    pub low_hz: f64,
    pub high_hz: f64,
}

impl BandLimits {
    pub const LOCOMOTION: BandLimits = BandLimits {
        low_hz: 0.5,
        high_hz: 3.0,
    };
    pub const FREEZE: BandLimits = BandLimits {
        low_hz: 3.0,
        high_hz: 8.0,
    };
}

/// Inclusive FFT bin range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinRange {
    pub low: usize,
    pub high: usize,
}

pub fn bin_range(band: BandLimits, sample_rate: f64, window_len: usize) -> BinRange {
    let bin_width = sample_rate / window_len as f64;
    BinRange {
        low: (band.low_hz / bin_width) as usize,
        high: (band.high_hz / bin_width) as usize,
    }
}

/// Sum of `power[low..=high]`, clamped to the spectrum
pub fn band_power(power: &[f64], range: BinRange) -> f64 {
    let Some(last) = power.len().checked_sub(1) else {
        return 0.0;
    };
    let high = range.high.min(last);
    if range.low > high {
        return 0.0;
    }
    power[range.low..=high].iter().sum()
}

/// Freeze-band power over locomotion-band power, summed over an axis group.
/// A group with no locomotion power has index 0.0.
pub fn freeze_index(spectra: &[&[f64]], locomotion: BinRange, freeze: BinRange) -> f64 {
    let lb: f64 = spectra.iter().map(|p| band_power(p, locomotion)).sum();
    let fb: f64 = spectra.iter().map(|p| band_power(p, freeze)).sum();
    if lb > 0.0 {
        fb / lb
    } else {
        0.0
    }
}

/// Power spectra `|X_k|²` of real series, reusing FFT plans across cycles.
pub struct SpectrumAnalyzer {
    planner: FftPlanner<f64>,
    buffer: Vec<Complex<f64>>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            buffer: Vec::new(),
        }
    }

    /// Full-length power spectrum of the raw series (no windowing, no detrending)
    pub fn power_spectrum(&mut self, signal: &[f64]) -> Vec<f64> {
        if signal.is_empty() {
            return Vec::new();
        }

        self.buffer.clear();
        self.buffer
            .extend(signal.iter().map(|&x| Complex::new(x, 0.0)));

        let fft = self.planner.plan_fft_forward(signal.len());
        fft.process(&mut self.buffer);

        self.buffer.iter().map(|c| c.norm_sqr()).collect()
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
