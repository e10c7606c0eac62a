//! # Lite Pipeline Module
//!
//! The fast local path: overlapping windows through the monophonic pitch
//! detector and the onset detector, stabilised by the two-speed emitter.
//! Every signal is stamped on the exercise clock.

use serde::{Deserialize, Serialize};

use crate::config::GateThresholds;
use crate::error::Result;
use crate::events::{IdAllocator, NoteSignal};
use crate::gate::{EmitterConfig, GateFrame, TwoSpeedEmitter};
use crate::onset::{OnsetConfig, OnsetDetector};
use crate::pitch::{MonophonicPitchDetector, PitchConfig};
use crate::window::{samples_to_ms, AudioWindow, WindowBuffer, WindowProfile, DEFAULT_HOP};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiteConfig {
    /// `LowNote` doubles the window for exercises in the bottom octave.
    pub profile: WindowProfile,
    pub hop_size: usize,
    pub pitch: PitchConfig,
    pub onset: OnsetConfig,
    pub emitter: EmitterConfig,
}

impl Default for LiteConfig {
    fn default() -> Self {
        Self {
            profile: WindowProfile::Standard,
            hop_size: DEFAULT_HOP,
            pitch: PitchConfig::default(),
            onset: OnsetConfig::default(),
            emitter: EmitterConfig::default(),
        }
    }
}

impl LiteConfig {
    pub fn validate(&self) -> Result<()> {
        WindowBuffer::new(self.profile.window_size(), self.hop_size, 44_100)?;
        self.pitch.validate()?;
        self.onset.validate()?;
        self.emitter.validate()
    }
}

/// Monophonic detection from raw samples to note signals.
#[derive(Debug)]
pub struct LitePipeline {
    buffer: WindowBuffer,
    pitch: MonophonicPitchDetector,
    onset: OnsetDetector,
    emitter: TwoSpeedEmitter,
    /// Exercise-clock time of the first sample fed, ms.
    clock_offset_ms: f64,
}

impl LitePipeline {
    pub fn new(config: &LiteConfig, sample_rate: u32, ids: IdAllocator) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            buffer: WindowBuffer::new(config.profile.window_size(), config.hop_size, sample_rate)?,
            pitch: MonophonicPitchDetector::new(config.pitch.clone())?,
            onset: OnsetDetector::new(config.onset.clone())?,
            emitter: TwoSpeedEmitter::with_ids(config.emitter.clone(), ids)?,
            clock_offset_ms: 0.0,
        })
    }

    /// Shifts every timestamp by `offset_ms` (the stream started late).
    pub fn with_clock_offset(mut self, offset_ms: f64) -> Self {
        self.clock_offset_ms = offset_ms;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.buffer.sample_rate()
    }

    /// Exercise-clock time just after the last sample fed, ms.
    pub fn clock_ms(&self) -> f64 {
        self.clock_offset_ms + samples_to_ms(self.buffer.samples_seen(), self.buffer.sample_rate())
    }

    /// Pushes calibrated gate thresholds into the running detectors.
    pub fn apply_thresholds(&mut self, thresholds: &GateThresholds) -> Result<()> {
        let mut pitch = self.pitch.config().clone();
        pitch.min_rms = thresholds.min_rms;
        pitch.min_confidence = 1.0 - thresholds.max_cmnd;
        self.pitch = MonophonicPitchDetector::new(pitch)?;
        self.emitter.set_onset_ratio(thresholds.onset_ratio)
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<NoteSignal> {
        let windows = self.buffer.push(samples);
        let mut out = Vec::new();
        for window in &windows {
            out.extend(self.process_window(window));
        }
        out
    }

    /// Runs one window. The frame is stamped at the window centre, where a
    /// new note first dominates the analysis.
    pub fn process_window(&mut self, window: &AudioWindow) -> Vec<NoteSignal> {
        let time_ms = self.clock_offset_ms + (window.start_ms() + window.end_ms()) / 2.0;

        let detection = self.pitch.detect_window(window);
        let onset = self.onset.process(window.samples(), time_ms);
        let pitch = detection
            .and_then(|d| d.pitch())
            .filter(|p| p.is_piano_key());

        let frame = GateFrame {
            pitch,
            confidence: detection.map_or(0.0, |d| d.confidence),
            rms: window.rms(),
            onset: onset.map(|o| o.strength),
        };
        log::trace!(
            "[LITE] {time_ms:.1} ms pitch={:?} conf={:.2} rms={:.4} onset={:?}",
            frame.pitch,
            frame.confidence,
            frame.rms,
            frame.onset
        );
        self.emitter.push(time_ms, &frame)
    }

    /// Closes any open note at the current clock.
    pub fn flush(&mut self) -> Vec<NoteSignal> {
        let now = self.clock_ms();
        self.emitter.flush(now)
    }
}
