//! # Polyphonic Detection Module
//!
//! Spectral peak picking for chords: every window yields an unordered set of
//! simultaneous notes, and [`ChordTracker`] turns consecutive sets into
//! confirmed note events.
//!
//! ## Features
//! - RMS gate and a 130..4186 Hz analysis band (no sub-bass false positives)
//! - Strict local maxima above 20 % of the strongest in-band magnitude
//! - Greedy acceptance that drops near-duplicates (30 Hz) and harmonics of
//!   already accepted peaks (5 % tolerance, up to the 6th)
//! - Log-parabolic frequency refinement per peak

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ensure_positive, ensure_range, FollowError, Result};
use crate::events::{EventKind, IdAllocator, NoteEvent, NoteSignal, NoteSource};
use crate::fft::{refine_peak_frequency, SpectrumAnalyzer};
use crate::tuning::Pitch;
use crate::window::rms;

/// Window length the remote pipeline runs the detector on.
pub const POLY_WINDOW: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolyConfig {
    pub min_rms: f32,
    pub min_frequency_hz: f32,
    pub max_frequency_hz: f32,
    /// Peaks below this fraction of the in-band maximum are ignored.
    pub relative_threshold: f32,
    /// Minimum spacing between two accepted peaks, Hz.
    pub min_separation_hz: f32,
    /// Relative tolerance on integer frequency ratios.
    pub harmonic_tolerance: f32,
    pub max_harmonic: u32,
    pub max_notes: usize,
}

impl Default for PolyConfig {
    fn default() -> Self {
        Self {
            min_rms: 0.01,
            min_frequency_hz: 130.0,
            max_frequency_hz: 4186.0,
            relative_threshold: 0.20,
            min_separation_hz: 30.0,
            harmonic_tolerance: 0.05,
            max_harmonic: 6,
            max_notes: 3,
        }
    }
}

impl PolyConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_range("poly.min_rms", self.min_rms, 0.0, 1.0)?;
        ensure_positive("poly.min_frequency_hz", self.min_frequency_hz)?;
        if self.max_frequency_hz <= self.min_frequency_hz {
            return Err(FollowError::config(
                "poly.max_frequency_hz",
                "must be above min_frequency_hz",
            ));
        }
        ensure_range("poly.relative_threshold", self.relative_threshold, 0.0, 1.0)?;
        ensure_positive("poly.min_separation_hz", self.min_separation_hz)?;
        ensure_range("poly.harmonic_tolerance", self.harmonic_tolerance, 0.0, 0.5)?;
        if self.max_notes == 0 {
            return Err(FollowError::config("poly.max_notes", "must be > 0"));
        }
        Ok(())
    }
}

/// One note of a polyphonic estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedNote {
    pub pitch: Pitch,
    /// Refined peak frequency, Hz.
    pub frequency: f32,
    pub magnitude: f32,
    /// Magnitude over the strongest in-band magnitude.
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy)]
struct Peak {
    frequency: f32,
    magnitude: f32,
}

/// Per-window chord estimator.
#[derive(Debug)]
pub struct PolyphonicDetector {
    config: PolyConfig,
    analyzer: Option<SpectrumAnalyzer>,
}

impl PolyphonicDetector {
    pub fn new(config: PolyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            analyzer: None,
        })
    }

    pub fn config(&self) -> &PolyConfig {
        &self.config
    }

    /// Estimates the notes sounding in `frame`, strongest first.
    ///
    /// Returns an empty set for silence or when nothing clears the threshold.
    pub fn detect(&mut self, frame: &[f32], sample_rate: u32) -> Vec<DetectedNote> {
        if frame.len() < 4 || sample_rate == 0 || rms(frame) < self.config.min_rms {
            return Vec::new();
        }

        let fits = self
            .analyzer
            .as_ref()
            .is_some_and(|a| a.size() == frame.len());
        if !fits {
            self.analyzer = Some(SpectrumAnalyzer::new(frame.len()));
        }
        let Some(analyzer) = self.analyzer.as_mut() else {
            return Vec::new();
        };
        let fft_size = analyzer.size();
        let spectrum = analyzer.magnitudes(frame);

        let bin_hz = sample_rate as f32 / fft_size as f32;
        let lo = ((self.config.min_frequency_hz / bin_hz).ceil() as usize).max(1);
        let hi = ((self.config.max_frequency_hz / bin_hz).floor() as usize).min(spectrum.len() - 2);
        if lo > hi {
            return Vec::new();
        }

        let max_magnitude = spectrum[lo..=hi].iter().copied().fold(0.0_f32, f32::max);
        if max_magnitude <= f32::EPSILON {
            return Vec::new();
        }
        let threshold = max_magnitude * self.config.relative_threshold;

        let mut peaks: Vec<Peak> = (lo..=hi)
            .filter(|&k| {
                spectrum[k] >= threshold
                    && spectrum[k] > spectrum[k - 1]
                    && spectrum[k] > spectrum[k + 1]
            })
            .map(|k| Peak {
                frequency: refine_peak_frequency(spectrum, k, fft_size, sample_rate),
                magnitude: spectrum[k],
            })
            .collect();
        peaks.sort_by(|a, b| b.magnitude.total_cmp(&a.magnitude));

        let mut accepted: Vec<Peak> = Vec::with_capacity(self.config.max_notes);
        for peak in peaks {
            if accepted.len() == self.config.max_notes {
                break;
            }
            if accepted.iter().any(|a| self.shadows(a, &peak)) {
                continue;
            }
            accepted.push(peak);
        }

        let mut notes: Vec<DetectedNote> = Vec::with_capacity(accepted.len());
        for peak in accepted {
            let Some(pitch) = Pitch::from_frequency(peak.frequency) else {
                continue;
            };
            if notes.iter().any(|n| n.pitch == pitch) {
                continue;
            }
            notes.push(DetectedNote {
                pitch,
                frequency: peak.frequency,
                magnitude: peak.magnitude,
                confidence: (peak.magnitude / max_magnitude).clamp(0.0, 1.0),
            });
        }
        notes
    }

    /// True when `candidate` is too close to, or a harmonic of, `accepted`.
    fn shadows(&self, accepted: &Peak, candidate: &Peak) -> bool {
        if (candidate.frequency - accepted.frequency).abs() < self.config.min_separation_hz {
            return true;
        }
        is_harmonic_of(
            candidate.frequency,
            accepted.frequency,
            self.config.max_harmonic,
            self.config.harmonic_tolerance,
        )
    }
}

/// True when `freq` is within `tolerance` of an integer multiple (2..=max) of
/// `fundamental`.
pub fn is_harmonic_of(freq: f32, fundamental: f32, max_harmonic: u32, tolerance: f32) -> bool {
    if fundamental <= 0.0 || freq <= fundamental {
        return false;
    }
    let ratio = freq / fundamental;
    let nearest = ratio.round();
    nearest >= 2.0 && nearest <= max_harmonic as f32 && (ratio - nearest).abs() / nearest <= tolerance
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Consecutive windows a pitch must appear in before it is confirmed.
    pub confirm_windows: usize,
    /// Consecutive windows a confirmed pitch may be missing before release.
    pub release_windows: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confirm_windows: 2,
            release_windows: 1,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.confirm_windows == 0 || self.release_windows == 0 {
            return Err(FollowError::config(
                "tracker.windows",
                "confirm and release windows must be > 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Track {
    event: NoteEvent,
    seen: usize,
    missing: usize,
    confirmed: bool,
}

/// Turns per-window note sets into a tentative / confirmed / released stream.
#[derive(Debug)]
pub struct ChordTracker {
    config: TrackerConfig,
    ids: IdAllocator,
    tracks: BTreeMap<Pitch, Track>,
}

impl ChordTracker {
    pub fn new(config: TrackerConfig, ids: IdAllocator) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ids,
            tracks: BTreeMap::new(),
        })
    }

    /// Pitches currently confirmed and sounding, ascending.
    pub fn sounding(&self) -> Vec<Pitch> {
        self.tracks
            .iter()
            .filter(|(_, t)| t.confirmed)
            .map(|(&p, _)| p)
            .collect()
    }

    /// Feeds the notes of the window stamped `time_ms`.
    pub fn update(&mut self, time_ms: f64, notes: &[DetectedNote]) -> Vec<NoteSignal> {
        let mut out = Vec::new();

        for note in notes {
            match self.tracks.get_mut(&note.pitch) {
                Some(track) => {
                    track.missing = 0;
                    track.seen += 1;
                    track.event.confidence = track.event.confidence.max(note.confidence);
                }
                None => {
                    let event = NoteEvent {
                        id: self.ids.next_id(),
                        pitch: note.pitch,
                        onset_ms: time_ms,
                        offset_ms: None,
                        velocity: None,
                        confidence: note.confidence,
                        onset_strength: None,
                        source: NoteSource::Polyphonic,
                        kind: EventKind::Tentative,
                    };
                    out.push(NoteSignal::Tentative(event.clone()));
                    self.tracks.insert(
                        note.pitch,
                        Track {
                            event,
                            seen: 1,
                            missing: 0,
                            confirmed: false,
                        },
                    );
                }
            }
        }

        let mut ended = Vec::new();
        for (&pitch, track) in self.tracks.iter_mut() {
            if !notes.iter().any(|n| n.pitch == pitch) {
                track.missing += 1;
                if !track.confirmed || track.missing >= self.config.release_windows {
                    ended.push(pitch);
                }
                continue;
            }
            if !track.confirmed && track.seen >= self.config.confirm_windows {
                track.confirmed = true;
                out.push(NoteSignal::Confirmed(track.event.confirmed()));
            }
        }

        for pitch in ended {
            if let Some(track) = self.tracks.remove(&pitch) {
                out.push(end_signal(&track, time_ms));
            }
        }
        out
    }

    /// Ends every open track.
    pub fn flush(&mut self, time_ms: f64) -> Vec<NoteSignal> {
        let tracks = std::mem::take(&mut self.tracks);
        tracks.values().map(|t| end_signal(t, time_ms)).collect()
    }
}

fn end_signal(track: &Track, time_ms: f64) -> NoteSignal {
    if track.confirmed {
        NoteSignal::Released {
            id: track.event.id,
            pitch: track.event.pitch,
            offset_ms: time_ms,
        }
    } else {
        NoteSignal::Cancelled {
            id: track.event.id,
            pitch: track.event.pitch,
        }
    }
}
