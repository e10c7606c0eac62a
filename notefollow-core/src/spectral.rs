//! # Spectral Verifier Module
//!
//! Single-frequency magnitudes (Goertzel) for checking a pitch estimate
//! against the spectrum without running a full FFT, plus a harmonic-pattern
//! analysis that judges whether a frequency is a fundamental or a partial of
//! some lower note.

use crate::fft::{apply_hann_window, remove_dc_offset};

/// Harmonics measured above the candidate (2f ... 8f).
const HARMONIC_COUNT: usize = 8;
/// Sub-harmonic divisors measured below the candidate (f/2, f/3, f/4).
const SUBHARMONIC_DIVISORS: [usize; 3] = [2, 3, 4];

/// Default ratio for [`prefers_octave_up`]: the octave must carry 20 % of the
/// lower frequency's magnitude.
pub const OCTAVE_UP_RATIO: f32 = 0.20;

/// Goertzel magnitude of `freq` in a Hann-windowed copy of `frame`,
/// normalised by the frame length.
pub fn goertzel_magnitude(frame: &[f32], freq: f32, sample_rate: u32) -> f32 {
    let n = frame.len();
    if n == 0 || !freq.is_finite() || freq <= 0.0 || sample_rate == 0 {
        return 0.0;
    }
    let mut windowed = frame.to_vec();
    remove_dc_offset(&mut windowed);
    apply_hann_window(&mut windowed);
    goertzel_raw(&windowed, freq, sample_rate)
}

/// Goertzel recursion on an already windowed frame.
fn goertzel_raw(windowed: &[f32], freq: f32, sample_rate: u32) -> f32 {
    let n = windowed.len();
    let omega = 2.0 * std::f64::consts::PI * freq as f64 / sample_rate as f64;
    let coeff = 2.0 * omega.cos();

    let mut s1 = 0.0_f64;
    let mut s2 = 0.0_f64;
    for &x in windowed {
        let s0 = x as f64 + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }

    let real = s1 - s2 * omega.cos();
    let imag = s2 * omega.sin();
    ((real * real + imag * imag).sqrt() / n as f64) as f32
}

/// Energy pattern around a candidate fundamental.
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicProfile {
    /// Candidate frequency in Hz.
    pub frequency: f32,
    /// Magnitudes at f, 2f ... 8f (index 0 is the candidate itself).
    pub harmonics: [f32; HARMONIC_COUNT],
    /// Magnitudes at f/2, f/3, f/4.
    pub subharmonics: [f32; 3],
}

impl HarmonicProfile {
    /// Fraction of consecutive harmonic pairs whose energy does not rise
    /// (10 % slack), over the partials that are actually present.
    pub fn decay_score(&self) -> f32 {
        let floor = self.harmonics[0] * 0.01;
        let mut pairs = 0;
        let mut decreasing = 0;
        for w in self.harmonics.windows(2) {
            if w[0] <= floor && w[1] <= floor {
                continue;
            }
            pairs += 1;
            if w[1] <= w[0] * 1.1 {
                decreasing += 1;
            }
        }
        if pairs == 0 {
            1.0
        } else {
            decreasing as f32 / pairs as f32
        }
    }

    /// Strongest sub-harmonic as `(divisor, magnitude / fundamental)`.
    pub fn strongest_subharmonic(&self) -> Option<(usize, f32)> {
        let fundamental = self.harmonics[0];
        if fundamental <= 0.0 {
            return None;
        }
        SUBHARMONIC_DIVISORS
            .iter()
            .zip(self.subharmonics.iter())
            .map(|(&d, &m)| (d, m / fundamental))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// A true fundamental shows decreasing harmonic energy and no stronger
    /// sub-harmonic.
    pub fn is_likely_fundamental(&self) -> bool {
        if self.harmonics[0] <= 0.0 {
            return false;
        }
        let no_stronger_sub = self
            .strongest_subharmonic()
            .map(|(_, ratio)| ratio < 1.0)
            .unwrap_or(true);
        no_stronger_sub && self.decay_score() >= 0.5
    }

    /// The frequency this profile points at: the candidate itself, or the
    /// strongest sub-harmonic when that one dominates.
    pub fn suggested_fundamental(&self) -> f32 {
        match self.strongest_subharmonic() {
            Some((divisor, ratio)) if ratio >= 1.0 => self.frequency / divisor as f32,
            _ => self.frequency,
        }
    }
}

/// Measures f, 2f ... 8f and f/2, f/3, f/4 (partials above Nyquist read as 0).
pub fn analyze_harmonics(frame: &[f32], freq: f32, sample_rate: u32) -> HarmonicProfile {
    let mut windowed = frame.to_vec();
    remove_dc_offset(&mut windowed);
    apply_hann_window(&mut windowed);

    let nyquist = sample_rate as f32 / 2.0;
    let magnitude = |f: f32| {
        if windowed.is_empty() || f <= 0.0 || f >= nyquist {
            0.0
        } else {
            goertzel_raw(&windowed, f, sample_rate)
        }
    };

    let mut harmonics = [0.0; HARMONIC_COUNT];
    for (k, slot) in harmonics.iter_mut().enumerate() {
        *slot = magnitude(freq * (k + 1) as f32);
    }
    let mut subharmonics = [0.0; 3];
    for (slot, &d) in subharmonics.iter_mut().zip(SUBHARMONIC_DIVISORS.iter()) {
        *slot = magnitude(freq / d as f32);
    }

    HarmonicProfile {
        frequency: freq,
        harmonics,
        subharmonics,
    }
}

/// True when `2·freq` carries at least `ratio` of the magnitude at `freq`.
pub fn prefers_octave_up(frame: &[f32], freq: f32, sample_rate: u32, ratio: f32) -> bool {
    let low = goertzel_magnitude(frame, freq, sample_rate);
    let high = goertzel_magnitude(frame, freq * 2.0, sample_rate);
    low > 0.0 && high >= low * ratio
}
