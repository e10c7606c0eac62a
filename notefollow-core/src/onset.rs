//! # Onset Detection Module
//!
//! Per-window attack detection with an adaptive threshold. Two interchangeable
//! strategies:
//!
//! - **Spectral flux**: sum of positive magnitude changes since the previous
//!   window. Threshold `avg × 1.5`, 50 ms cooldown.
//! - **High-frequency content (HFC)**: rise in bin-index weighted energy,
//!   which jumps on the broadband click of a hammer strike. Threshold
//!   `avg × 2.0`, 40 ms cooldown.
//!
//! Both measures are relative to the current window's content, so they do not
//! depend on input gain.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{ensure_positive, ensure_range, FollowError, Result};
use crate::fft::SpectrumAnalyzer;
use crate::window::rms;

/// Relative change a window must reach regardless of the adaptive threshold;
/// keeps rounding noise on a steady tone from tripping a quiet history.
const ONSET_FLOOR: f32 = 0.05;

/// Onset measure used by [`OnsetDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnsetStrategy {
    #[default]
    SpectralFlux,
    HighFrequencyContent,
}

impl OnsetStrategy {
    /// Threshold multiplier applied to the rolling average.
    pub fn multiplier(self) -> f32 {
        match self {
            OnsetStrategy::SpectralFlux => 1.5,
            OnsetStrategy::HighFrequencyContent => 2.0,
        }
    }

    /// Minimum gap between two onsets, ms.
    pub fn cooldown_ms(self) -> f64 {
        match self {
            OnsetStrategy::SpectralFlux => 50.0,
            OnsetStrategy::HighFrequencyContent => 40.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnsetConfig {
    pub strategy: OnsetStrategy,
    /// Number of past values averaged for the threshold.
    pub history_len: usize,
    /// Windows below this RMS never report an onset.
    pub min_energy: f32,
}

impl Default for OnsetConfig {
    fn default() -> Self {
        Self {
            strategy: OnsetStrategy::SpectralFlux,
            history_len: 10,
            min_energy: 0.01,
        }
    }
}

impl OnsetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_len == 0 {
            return Err(FollowError::config("onset.history_len", "must be > 0"));
        }
        ensure_range("onset.min_energy", self.min_energy, 0.0, 1.0)?;
        ensure_positive("onset.multiplier", self.strategy.multiplier())
    }
}

/// A detected attack.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Onset {
    pub time_ms: f64,
    /// Measure value over its rolling average (floored, so always finite).
    pub strength: f32,
}

/// Stateful per-window onset detector.
#[derive(Debug)]
pub struct OnsetDetector {
    config: OnsetConfig,
    analyzer: Option<SpectrumAnalyzer>,
    prev_spectrum: Vec<f32>,
    prev_hfc: f32,
    prev_total: f32,
    prev_rms: f32,
    history: VecDeque<f32>,
    last_onset_ms: Option<f64>,
}

impl OnsetDetector {
    pub fn new(config: OnsetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            history: VecDeque::with_capacity(config.history_len),
            config,
            analyzer: None,
            prev_spectrum: Vec::new(),
            prev_hfc: 0.0,
            prev_total: 0.0,
            prev_rms: 0.0,
            last_onset_ms: None,
        })
    }

    pub fn strategy(&self) -> OnsetStrategy {
        self.config.strategy
    }

    /// Feeds one window ending at `time_ms`; returns an onset if this window
    /// starts an attack.
    pub fn process(&mut self, window: &[f32], time_ms: f64) -> Option<Onset> {
        if window.is_empty() {
            return None;
        }

        let value = self.measure(window);
        let average = if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f32>() / self.history.len() as f32
        };
        let threshold = average * self.config.strategy.multiplier();

        if self.history.len() == self.config.history_len {
            self.history.pop_front();
        }
        self.history.push_back(value);

        let level = rms(window);
        let falling = level < self.prev_rms;
        self.prev_rms = level;
        if level < self.config.min_energy || falling {
            return None;
        }
        if value <= threshold || value < ONSET_FLOOR {
            return None;
        }
        if let Some(last) = self.last_onset_ms {
            if time_ms - last < self.config.strategy.cooldown_ms() {
                return None;
            }
        }

        self.last_onset_ms = Some(time_ms);
        let strength = value / average.max(ONSET_FLOOR);
        Some(Onset { time_ms, strength })
    }

    /// Relative change measure in `[0, 1]`: 1.0 means all of this window's
    /// content is new, ~0 means a steady sound.
    fn measure(&mut self, window: &[f32]) -> f32 {
        let fits = self
            .analyzer
            .as_ref()
            .is_some_and(|a| a.size() == window.len());
        if !fits {
            self.analyzer = Some(SpectrumAnalyzer::new(window.len()));
            self.prev_spectrum.clear();
            self.prev_hfc = 0.0;
            self.prev_total = 0.0;
        }
        let Some(analyzer) = self.analyzer.as_mut() else {
            return 0.0;
        };
        let spectrum = analyzer.magnitudes(window);

        let value = match self.config.strategy {
            OnsetStrategy::SpectralFlux => {
                let total: f32 = spectrum.iter().sum();
                let flux: f32 = if self.prev_spectrum.len() == spectrum.len() {
                    spectrum
                        .iter()
                        .zip(self.prev_spectrum.iter())
                        .map(|(&now, &before)| (now - before).max(0.0))
                        .sum()
                } else {
                    total
                };
                // Normalised by the louder of the two windows, so a window
                // whose content just collapsed does not look all new.
                let scale = total.max(self.prev_total);
                self.prev_total = total;
                if scale > f32::EPSILON { flux / scale } else { 0.0 }
            }
            OnsetStrategy::HighFrequencyContent => {
                let hfc: f32 = spectrum
                    .iter()
                    .enumerate()
                    .map(|(k, &m)| k as f32 * m * m)
                    .sum();
                let rise = (hfc - self.prev_hfc).max(0.0);
                let scale = hfc.max(self.prev_hfc);
                self.prev_hfc = hfc;
                if scale > f32::EPSILON { rise / scale } else { 0.0 }
            }
        };

        self.prev_spectrum.clear();
        self.prev_spectrum.extend_from_slice(spectrum);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    const SR: f32 = 44_100.0;
    const N: usize = 1024;

    fn tone_window(freq: f32, amp: f32, offset: usize) -> Vec<f32> {
        (0..N)
            .map(|i| amp * (2.0 * PI * freq * (i + offset) as f32 / SR).sin())
            .collect()
    }

    fn run(strategy: OnsetStrategy) -> Vec<f64> {
        let mut det = OnsetDetector::new(OnsetConfig {
            strategy,
            ..OnsetConfig::default()
        })
        .unwrap();
        let mut onsets = Vec::new();
        // 10 silent windows, then a sustained tone, one window every 12 ms.
        for k in 0..30 {
            let window = if k < 10 {
                vec![0.0; N]
            } else {
                tone_window(440.0, 0.5, k * 512)
            };
            if let Some(o) = det.process(&window, k as f64 * 12.0) {
                onsets.push(o.time_ms);
            }
        }
        onsets
    }

    #[test]
    fn spectral_flux_fires_once_on_the_attack() {
        assert_eq!(run(OnsetStrategy::SpectralFlux), vec![120.0]);
    }

    #[test]
    fn hfc_fires_once_on_the_attack() {
        assert_eq!(run(OnsetStrategy::HighFrequencyContent), vec![120.0]);
    }

    #[test]
    fn cooldown_suppresses_double_triggers() {
        let mut det = OnsetDetector::new(OnsetConfig::default()).unwrap();
        assert!(det.process(&tone_window(440.0, 0.5, 0), 0.0).is_some());
        det.process(&vec![0.0; N], 10.0);
        assert!(det.process(&tone_window(880.0, 0.9, 0), 20.0).is_none());
    }

    #[test]
    fn cutting_a_note_off_is_not_an_onset() {
        let mut det = OnsetDetector::new(OnsetConfig::default()).unwrap();
        let mut onsets = Vec::new();
        // A held tone, then windows sliding into silence as it stops.
        for k in 0..20 {
            let mut window = tone_window(440.0, 0.5, k * 512);
            let cut = N.saturating_sub(k.saturating_sub(9) * 128);
            window[cut..].fill(0.0);
            if let Some(o) = det.process(&window, k as f64 * 12.0) {
                onsets.push(o.time_ms);
            }
        }
        assert_eq!(onsets, vec![0.0]);
    }

    #[test]
    fn zero_history_is_a_config_error() {
        let config = OnsetConfig {
            history_len: 0,
            ..OnsetConfig::default()
        };
        assert!(OnsetDetector::new(config).is_err());
    }
}
