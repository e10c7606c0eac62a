//! # Fast Fourier Transform (FFT) Module
//!
//! Magnitude spectra for the polyphonic and onset detectors.
//!
//! ## Features
//! - High-performance FFT using RustFFT, plan cached per frame size
//! - Hann windowing for reduced spectral leakage
//! - DC offset removal for accurate analysis
//! - Log-parabolic peak refinement for sub-bin frequency accuracy

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Removes the DC offset from a signal by making its average value zero.
pub(crate) fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Hann window coefficient `i` of an `n`-point window.
#[inline]
pub(crate) fn hann(i: usize, n: usize) -> f32 {
    if n < 2 {
        return 1.0;
    }
    0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos())
}

/// Applies a Hann window to the input buffer in place.
pub(crate) fn apply_hann_window(buffer: &mut [f32]) {
    let n = buffer.len();
    for (i, sample) in buffer.iter_mut().enumerate() {
        *sample *= hann(i, n);
    }
}

/// Centre frequency of `bin` for an `fft_size`-point transform.
pub fn bin_frequency(bin: usize, fft_size: usize, sample_rate: u32) -> f32 {
    bin as f32 * sample_rate as f32 / fft_size as f32
}

/// Reusable windowed-magnitude-spectrum calculator for one frame size.
///
/// The FFT plan and scratch buffers are allocated once; [`magnitudes`]
/// only copies the frame in.
///
/// [`magnitudes`]: SpectrumAnalyzer::magnitudes
pub struct SpectrumAnalyzer {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
}

impl std::fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("size", &self.size)
            .finish()
    }
}

impl SpectrumAnalyzer {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        Self {
            size,
            fft,
            window: (0..size).map(|i| hann(i, size)).collect(),
            buffer: vec![Complex { re: 0.0, im: 0.0 }; size],
            magnitudes: vec![0.0; size / 2 + 1],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// DC-removed, Hann-windowed magnitude spectrum (`size/2 + 1` bins).
    ///
    /// Frames shorter than the analyzer are zero-padded, longer ones truncated.
    pub fn magnitudes(&mut self, frame: &[f32]) -> &[f32] {
        let used = frame.len().min(self.size);
        let mean = if used > 0 {
            frame[..used].iter().sum::<f32>() / used as f32
        } else {
            0.0
        };

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = if i < used { frame[i] - mean } else { 0.0 };
            *slot = Complex {
                re: sample * self.window[i],
                im: 0.0,
            };
        }

        self.fft.process(&mut self.buffer);

        for (mag, c) in self.magnitudes.iter_mut().zip(self.buffer.iter()) {
            *mag = c.norm(); // .norm() is sqrt(re^2 + im^2)
        }
        &self.magnitudes
    }
}

/// Refines the frequency of a spectral peak at `peak_bin`.
///
/// Fits a parabola through the log magnitudes of the bin and its two
/// neighbours; falls back to the bin centre when the fit is degenerate.
pub fn refine_peak_frequency(
    spectrum_magnitudes: &[f32],
    peak_bin: usize,
    fft_size: usize,
    sample_rate: u32,
) -> f32 {
    let rough_freq = bin_frequency(peak_bin, fft_size, sample_rate);
    if peak_bin == 0 || peak_bin + 1 >= spectrum_magnitudes.len() {
        return rough_freq;
    }

    let y1 = spectrum_magnitudes[peak_bin - 1].ln();
    let y2 = spectrum_magnitudes[peak_bin].ln();
    let y3 = spectrum_magnitudes[peak_bin + 1].ln();
    if !y1.is_finite() || !y2.is_finite() || !y3.is_finite() {
        return rough_freq;
    }

    let denominator = 2.0 * y2 - y1 - y3;
    if denominator.abs() < 1e-6 {
        return rough_freq;
    }

    let peak_shift = ((y3 - y1) / (2.0 * denominator)).clamp(-0.5, 0.5);
    let final_freq = (peak_bin as f32 + peak_shift) * sample_rate as f32 / fft_size as f32;

    if final_freq.is_finite() && final_freq > 0.0 {
        final_freq
    } else {
        rough_freq
    }
}
