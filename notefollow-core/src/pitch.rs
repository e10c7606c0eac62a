//! # Pitch Detection Module
//!
//! Monophonic fundamental-frequency estimation for piano audio, built on the
//! YIN cumulative-mean-normalised-difference (CMND) function.
//!
//! Plain YIN reports the *lowest* clear periodicity. On a piano the first
//! sub-multiple of the fundamental is often clearer than the fundamental
//! itself, so this detector deliberately leans the other way: after finding a
//! dip it tries the octaves above it and keeps the best-scoring candidate, then
//! runs a spectral check on anything that lands below C3.
//!
//! ## Features
//! - RMS silence gate
//! - First-dip search with local-minimum refinement, global-minimum fallback
//! - Parabolic interpolation for sub-sample accuracy
//! - Octave-up disambiguation scored on clarity and register
//! - 130 Hz floor correction via Goertzel magnitudes

use serde::{Deserialize, Serialize};

use crate::error::{ensure_positive, ensure_range, Result};
use crate::spectral::{prefers_octave_up, OCTAVE_UP_RATIO};
use crate::tuning::Pitch;
use crate::window::{rms, AudioWindow};

/// CMND value a dip must fall under to count as periodic.
const CMND_THRESHOLD: f32 = 0.20;
/// Octave multipliers tried above the first dip.
const OCTAVE_MULTIPLIERS: [f32; 4] = [1.0, 2.0, 4.0, 8.0];
/// Octave-up candidates must land inside this band (Hz).
const OCTAVE_CANDIDATE_MIN_HZ: f32 = 130.0;
const OCTAVE_CANDIDATE_MAX_HZ: f32 = 4500.0;
/// Anything below this is treated as a sub-harmonic unless it can be lifted.
const OCTAVE_FLOOR_HZ: f32 = 130.0;
/// Below this the floor correction does not even try.
const SUBHARMONIC_MIN_HZ: f32 = 32.0;
/// Windows shorter than this cannot hold a useful lag range.
const MIN_WINDOW: usize = 64;

/// Tunables for [`MonophonicPitchDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PitchConfig {
    /// Windows quieter than this are silence.
    pub min_rms: f32,
    /// Detections with `1 - cmnd` below this are dropped.
    pub min_confidence: f32,
    /// Lowest fundamental the lag search covers; sets `tau_max`.
    pub min_frequency_hz: f32,
}

impl Default for PitchConfig {
    fn default() -> Self {
        Self {
            min_rms: 0.005,
            min_confidence: 0.5,
            min_frequency_hz: 50.0,
        }
    }
}

impl PitchConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_range("pitch.min_rms", self.min_rms, 0.0, 1.0)?;
        ensure_range("pitch.min_confidence", self.min_confidence, 0.0, 1.0)?;
        ensure_positive("pitch.min_frequency_hz", self.min_frequency_hz)
    }
}

/// One window's fundamental-frequency estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Estimated fundamental in Hz (always >= 130).
    pub frequency_hz: f32,
    /// `1 - cmnd` at the chosen lag, in `[0, 1]`.
    pub confidence: f32,
    /// CMND value at the dip the search settled on.
    pub cmnd_min: f32,
}

impl Detection {
    /// Nearest MIDI pitch.
    pub fn pitch(&self) -> Option<Pitch> {
        Pitch::from_frequency(self.frequency_hz)
    }
}

/// An octave candidate during disambiguation.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    frequency: f32,
    cmnd: f32,
    score: f32,
}

/// Stateless per-window pitch detector.
///
/// `detect` takes `&self`: the same window always yields the same result.
#[derive(Debug, Clone)]
pub struct MonophonicPitchDetector {
    config: PitchConfig,
}

impl MonophonicPitchDetector {
    pub fn new(config: PitchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PitchConfig {
        &self.config
    }

    pub fn detect_window(&self, window: &AudioWindow) -> Option<Detection> {
        self.detect(window.samples(), window.sample_rate())
    }

    /// Estimates the fundamental of `signal`.
    ///
    /// # Returns
    /// * `Some(detection)` - a pitch at or above 130 Hz
    /// * `None` - silence, no usable lag, a sub-harmonic that could not be
    ///   lifted above the floor, or confidence under the configured minimum
    pub fn detect(&self, signal: &[f32], sample_rate: u32) -> Option<Detection> {
        let frame_size = signal.len();
        if frame_size < MIN_WINDOW || sample_rate == 0 {
            return None;
        }

        // --- Noise Gate: Calculate RMS to filter out silence/noise ---
        if rms(signal) < self.config.min_rms {
            return None;
        }

        let sr = sample_rate as f32;
        let tau_max = (frame_size / 2).min((sr / self.config.min_frequency_hz).ceil() as usize);
        if tau_max < 4 {
            return None;
        }

        let diff = difference_function(signal, tau_max);
        let cmnd = cumulative_mean_normalized_difference(&diff);

        let fallback_lo = (sr / 2000.0).ceil() as usize;
        let fallback_hi = (sr / 80.0) as usize;
        let best_tau = first_minimum(&cmnd, CMND_THRESHOLD)
            .or_else(|| global_minimum(&cmnd, fallback_lo, fallback_hi))?;

        let refined_tau = parabolic_interpolation(&cmnd, best_tau);
        let chosen = choose_octave(&cmnd, refined_tau, sr)?;

        let mut frequency = chosen.frequency;
        if frequency < OCTAVE_FLOOR_HZ {
            if frequency >= SUBHARMONIC_MIN_HZ
                && prefers_octave_up(signal, frequency, sample_rate, OCTAVE_UP_RATIO)
            {
                log::trace!("[PITCH] floor correction {frequency:.1} Hz -> {:.1} Hz", frequency * 2.0);
                frequency *= 2.0;
            }
            if frequency < OCTAVE_FLOOR_HZ {
                return None;
            }
        }

        // The spectral lift keeps the clarity of the lag it came from.
        let confidence = (1.0 - chosen.cmnd).clamp(0.0, 1.0);
        if confidence < self.config.min_confidence || !frequency.is_finite() {
            return None;
        }

        Some(Detection {
            frequency_hz: frequency,
            confidence,
            cmnd_min: cmnd[best_tau].clamp(0.0, 1.0),
        })
    }
}

/// `d(tau) = sum (x[i] - x[i + tau])^2` over a fixed integration window of
/// `len - tau_max` samples, for `tau` in `0..tau_max`.
pub fn difference_function(signal: &[f32], tau_max: usize) -> Vec<f32> {
    let tau_max = tau_max.min(signal.len());
    let integration = signal.len() - tau_max;
    let mut diff = vec![0.0; tau_max];
    for (tau, slot) in diff.iter_mut().enumerate().skip(1) {
        let mut sum = 0.0;
        for i in 0..integration {
            let delta = signal[i] - signal[i + tau];
            sum += delta * delta;
        }
        *slot = sum;
    }
    diff
}

/// `cmnd[0] = 1`, `cmnd[tau] = d(tau)·tau / sum_{1..=tau} d(k)`; a zero running
/// sum maps to 1.
pub fn cumulative_mean_normalized_difference(diff: &[f32]) -> Vec<f32> {
    let mut cmnd = vec![1.0; diff.len()];
    let mut running_sum = 0.0;
    for tau in 1..diff.len() {
        running_sum += diff[tau];
        cmnd[tau] = if running_sum > 0.0 {
            diff[tau] * tau as f32 / running_sum
        } else {
            1.0
        };
    }
    cmnd
}

/// First lag from 2 upward under `threshold`, followed downhill to the bottom
/// of its dip.
fn first_minimum(cmnd: &[f32], threshold: f32) -> Option<usize> {
    let start = (2..cmnd.len()).find(|&tau| cmnd[tau] < threshold)?;
    let mut tau = start;
    while tau + 1 < cmnd.len() && cmnd[tau + 1] < cmnd[tau] {
        tau += 1;
    }
    Some(tau)
}

/// Lowest CMND value over `[lo, hi)`, clipped to the computed lags.
fn global_minimum(cmnd: &[f32], lo: usize, hi: usize) -> Option<usize> {
    let lo = lo.max(2);
    let hi = hi.min(cmnd.len());
    if lo >= hi {
        return None;
    }
    (lo..hi).min_by(|&a, &b| {
        cmnd[a]
            .partial_cmp(&cmnd[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Sub-sample lag from a parabola through `tau` and its two neighbours.
fn parabolic_interpolation(cmnd: &[f32], tau: usize) -> f32 {
    if tau < 1 || tau + 1 >= cmnd.len() {
        return tau as f32;
    }
    let y1 = cmnd[tau - 1];
    let y2 = cmnd[tau];
    let y3 = cmnd[tau + 1];
    let denominator = y1 - 2.0 * y2 + y3;
    if denominator.abs() < 1e-12 {
        return tau as f32;
    }
    let shift = ((y1 - y3) / (2.0 * denominator)).clamp(-1.0, 1.0);
    tau as f32 + shift
}

/// Register preference: 1.0 across 200..=600 Hz, tapering to 0.6 at 80 Hz and
/// 2400 Hz, flat 0.3 outside.
fn frequency_preference(freq: f32) -> f32 {
    if freq < 80.0 {
        0.3
    } else if freq < 200.0 {
        0.6 + 0.4 * (freq - 80.0) / 120.0
    } else if freq <= 600.0 {
        1.0
    } else if freq <= 2400.0 {
        1.0 - 0.4 * (freq - 600.0) / 1800.0
    } else {
        0.3
    }
}

/// Scores the refined lag and its octave-up multiples; the base candidate is
/// always eligible, multiples need `cmnd < 0.20` and a 130..=4500 Hz frequency.
fn choose_octave(cmnd: &[f32], refined_tau: f32, sample_rate: f32) -> Option<Candidate> {
    if refined_tau <= 0.0 {
        return None;
    }

    let mut best: Option<Candidate> = None;
    for &multiplier in OCTAVE_MULTIPLIERS.iter() {
        let tau = refined_tau / multiplier;
        let index = tau.round() as usize;
        if index < 1 || index >= cmnd.len() {
            continue;
        }
        let value = cmnd[index];
        let frequency = sample_rate / tau;

        if multiplier > 1.0
            && (value >= CMND_THRESHOLD
                || !(OCTAVE_CANDIDATE_MIN_HZ..=OCTAVE_CANDIDATE_MAX_HZ).contains(&frequency))
        {
            continue;
        }

        let clarity = 1.0 - value;
        let octave_bonus = 0.1 * multiplier.log2();
        let score = 0.4 * clarity + 0.5 * frequency_preference(frequency) + 0.1 * octave_bonus;

        if best.map_or(true, |b| score > b.score) {
            best = Some(Candidate {
                frequency,
                cmnd: value,
                score,
            });
        }
    }
    best
}
