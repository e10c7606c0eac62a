//! # Calibration Module
//!
//! Derives [`GateThresholds`] for the current room and instrument from two
//! short recordings: a stretch of silence (noise floor) followed by a
//! sustained note (pitch clarity and level stability).
//!
//! The session is a plain value. [`process_event`] is the whole transition
//! table; [`Calibrator`] is a thin wrapper that measures windows and steps
//! the machine.

use serde::{Deserialize, Serialize};

use crate::config::GateThresholds;
use crate::error::{FollowError, Result};
use crate::pitch::{MonophonicPitchDetector, PitchConfig};
use crate::window::AudioWindow;

/// Lowest silence gate ever produced, whatever the room.
const MIN_RMS_FLOOR: f32 = 0.002;
/// A noise gate above this would also silence a firmly played note.
const MIN_RMS_CEILING: f32 = 0.5;
const NOISE_MARGIN: f32 = 2.0;
const CMND_MARGIN: f32 = 0.05;
const MAX_CMND_RANGE: (f32, f32) = (0.1, 0.5);
const ONSET_RATIO_RANGE: (f32, f32) = (1.1, 1.5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    #[default]
    Silence,
    Sustain,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Windows of room noise to collect.
    pub silence_windows: usize,
    /// Pitched windows of the held note to collect.
    pub sustain_windows: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            silence_windows: 40,
            sustain_windows: 60,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.silence_windows == 0 {
            return Err(FollowError::config("calibration.silence_windows", "must be > 0"));
        }
        if self.sustain_windows < 2 {
            return Err(FollowError::config("calibration.sustain_windows", "must be >= 2"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationInput {
    /// Measurements of one analysis window; `cmnd` is `None` when no pitch
    /// was found.
    Window { rms: f32, cmnd: Option<f32> },
    /// Discard everything and start again from silence.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalibrationOutput {
    PhaseChanged(CalibrationPhase),
    Progress {
        phase: CalibrationPhase,
        collected: usize,
        needed: usize,
    },
    Thresholds(GateThresholds),
}

/// Samples collected so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSession {
    phase: CalibrationPhase,
    noise_rms: Vec<f32>,
    sustain_rms: Vec<f32>,
    sustain_cmnd: Vec<f32>,
    thresholds: Option<GateThresholds>,
}

impl CalibrationSession {
    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn thresholds(&self) -> Option<GateThresholds> {
        self.thresholds
    }
}

/// One calibration step.
pub fn process_event(
    mut session: CalibrationSession,
    input: CalibrationInput,
    config: &CalibrationConfig,
) -> (CalibrationSession, Vec<CalibrationOutput>) {
    let (rms, cmnd) = match input {
        CalibrationInput::Restart => {
            let outputs = vec![CalibrationOutput::PhaseChanged(CalibrationPhase::Silence)];
            return (CalibrationSession::default(), outputs);
        }
        CalibrationInput::Window { rms, cmnd } => (rms, cmnd),
    };
    if !rms.is_finite() {
        return (session, Vec::new());
    }

    let mut outputs = Vec::new();
    match session.phase {
        CalibrationPhase::Silence => {
            session.noise_rms.push(rms);
            outputs.push(CalibrationOutput::Progress {
                phase: CalibrationPhase::Silence,
                collected: session.noise_rms.len(),
                needed: config.silence_windows,
            });
            if session.noise_rms.len() >= config.silence_windows {
                session.phase = CalibrationPhase::Sustain;
                outputs.push(CalibrationOutput::PhaseChanged(CalibrationPhase::Sustain));
            }
        }
        CalibrationPhase::Sustain => {
            // Windows before the key goes down, or without a pitch, don't count.
            let gate = noise_gate(&session.noise_rms);
            let Some(cmnd) = cmnd.filter(|c| c.is_finite() && rms >= gate) else {
                return (session, outputs);
            };
            session.sustain_rms.push(rms);
            session.sustain_cmnd.push(cmnd);
            outputs.push(CalibrationOutput::Progress {
                phase: CalibrationPhase::Sustain,
                collected: session.sustain_rms.len(),
                needed: config.sustain_windows,
            });
            if session.sustain_rms.len() >= config.sustain_windows {
                let thresholds = derive_thresholds(&session);
                log::info!(
                    "[CAL] min_rms={:.4} max_cmnd={:.3} onset_ratio={:.2}",
                    thresholds.min_rms,
                    thresholds.max_cmnd,
                    thresholds.onset_ratio
                );
                session.thresholds = Some(thresholds);
                session.phase = CalibrationPhase::Done;
                outputs.push(CalibrationOutput::PhaseChanged(CalibrationPhase::Done));
                outputs.push(CalibrationOutput::Thresholds(thresholds));
            }
        }
        CalibrationPhase::Done => {}
    }
    (session, outputs)
}

fn noise_gate(noise: &[f32]) -> f32 {
    (percentile(noise, 0.95) * NOISE_MARGIN).clamp(MIN_RMS_FLOOR, MIN_RMS_CEILING)
}

fn derive_thresholds(session: &CalibrationSession) -> GateThresholds {
    let min_rms = noise_gate(&session.noise_rms);
    let max_cmnd =
        (percentile(&session.sustain_cmnd, 0.90) + CMND_MARGIN).clamp(MAX_CMND_RANGE.0, MAX_CMND_RANGE.1);

    // A steady sustain barely moves frame to frame; a strike must stand out
    // from that jitter.
    let ratios: Vec<f32> = session
        .sustain_rms
        .windows(2)
        .filter(|w| w[0] > f32::EPSILON)
        .map(|w| w[1] / w[0])
        .collect();
    let onset_ratio = (1.0 + 3.0 * std_dev(&ratios)).clamp(ONSET_RATIO_RANGE.0, ONSET_RATIO_RANGE.1);

    GateThresholds {
        min_rms,
        max_cmnd,
        onset_ratio,
    }
}

/// Nearest-rank percentile; 0 for an empty slice.
fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p * sorted.len() as f32).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn std_dev(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
    var.sqrt()
}

/// Measures windows and feeds them through [`process_event`].
#[derive(Debug, Clone)]
pub struct Calibrator {
    config: CalibrationConfig,
    session: CalibrationSession,
    detector: MonophonicPitchDetector,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Result<Self> {
        config.validate()?;
        // Calibration wants every dip, so the detector gates nothing itself.
        let detector = MonophonicPitchDetector::new(PitchConfig {
            min_rms: 0.0,
            min_confidence: 0.0,
            ..PitchConfig::default()
        })?;
        Ok(Self {
            config,
            session: CalibrationSession::default(),
            detector,
        })
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.session.phase()
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    /// Feeds pre-computed measurements.
    pub fn add_sample(&mut self, input: CalibrationInput) -> Vec<CalibrationOutput> {
        let session = std::mem::take(&mut self.session);
        let (session, outputs) = process_event(session, input, &self.config);
        self.session = session;
        outputs
    }

    /// Measures one window and feeds it.
    pub fn observe(&mut self, window: &AudioWindow) -> Vec<CalibrationOutput> {
        let cmnd = self.detector.detect_window(window).map(|d| d.cmnd_min);
        self.add_sample(CalibrationInput::Window {
            rms: window.rms(),
            cmnd,
        })
    }

    pub fn restart(&mut self) -> Vec<CalibrationOutput> {
        self.add_sample(CalibrationInput::Restart)
    }

    /// The derived thresholds, once both phases are complete.
    pub fn finish(&self) -> Result<GateThresholds> {
        self.session.thresholds().ok_or_else(|| {
            FollowError::config(
                "calibration",
                format!("session incomplete, still in {:?}", self.session.phase()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowBuffer;
    use std::f32::consts::PI;

    fn small() -> CalibrationConfig {
        CalibrationConfig {
            silence_windows: 3,
            sustain_windows: 4,
        }
    }

    fn window(rms: f32, cmnd: Option<f32>) -> CalibrationInput {
        CalibrationInput::Window { rms, cmnd }
    }

    #[test]
    fn phases_advance_in_order() {
        let config = small();
        let mut session = CalibrationSession::default();
        let mut phases = Vec::new();

        let inputs = [
            window(0.001, None),
            window(0.002, None),
            window(0.003, None),
            // quiet and unpitched: ignored during sustain
            window(0.001, Some(0.1)),
            window(0.2, None),
            window(0.2, Some(0.10)),
            window(0.2, Some(0.12)),
            window(0.2, Some(0.08)),
            window(0.2, Some(0.11)),
        ];
        for input in inputs {
            let (next, outputs) = process_event(session, input, &config);
            session = next;
            phases.extend(outputs.iter().filter_map(|o| match o {
                CalibrationOutput::PhaseChanged(p) => Some(*p),
                _ => None,
            }));
        }

        assert_eq!(phases, vec![CalibrationPhase::Sustain, CalibrationPhase::Done]);
        let thresholds = session.thresholds().unwrap();
        // p95 of noise is 0.003, doubled
        assert!((thresholds.min_rms - 0.006).abs() < 1e-6);
        // p90 of cmnd is 0.12, plus margin
        assert!((thresholds.max_cmnd - 0.17).abs() < 1e-6);
        // perfectly steady level: the ratio sits at its lower clamp
        assert!((thresholds.onset_ratio - 1.1).abs() < 1e-6);
    }

    #[test]
    fn thresholds_are_clamped() {
        let config = small();
        let mut session = CalibrationSession::default();
        for input in [
            window(0.0, None),
            window(0.0, None),
            window(0.0, None),
            window(0.1, Some(0.9)),
            window(0.4, Some(0.9)),
            window(0.1, Some(0.9)),
            window(0.4, Some(0.9)),
        ] {
            session = process_event(session, input, &config).0;
        }
        let thresholds = session.thresholds().unwrap();
        assert_eq!(thresholds.min_rms, MIN_RMS_FLOOR);
        assert_eq!(thresholds.max_cmnd, 0.5);
        assert_eq!(thresholds.onset_ratio, 1.5);
        thresholds.validate().unwrap();
    }

    #[test]
    fn loud_room_still_yields_a_usable_gate() {
        let config = small();
        let mut session = CalibrationSession::default();
        for _ in 0..3 {
            session = process_event(session, window(0.6, None), &config).0;
        }
        for _ in 0..4 {
            session = process_event(session, window(0.7, Some(0.1)), &config).0;
        }
        let thresholds = session.thresholds().unwrap();
        assert_eq!(thresholds.min_rms, MIN_RMS_CEILING);
        thresholds.validate().unwrap();
        assert!(crate::config::EngineConfig::calibrated(thresholds).is_ok());
    }

    #[test]
    fn restart_discards_progress() {
        let config = small();
        let (session, _) = process_event(CalibrationSession::default(), window(0.01, None), &config);
        let (session, outputs) = process_event(session, CalibrationInput::Restart, &config);
        assert_eq!(session, CalibrationSession::default());
        assert_eq!(outputs, vec![CalibrationOutput::PhaseChanged(CalibrationPhase::Silence)]);
    }

    #[test]
    fn calibrator_measures_real_windows() {
        let sr = 44_100;
        let mut calibrator = Calibrator::new(small()).unwrap();
        assert!(calibrator.finish().is_err());

        let mut buffer = WindowBuffer::new(3072, 512, sr).unwrap();
        let mut audio = vec![0.0f32; 3072 + 512 * 2];
        audio.extend((0..3072 + 512 * 3).map(|i| 0.3 * (2.0 * PI * 440.0 * i as f32 / sr as f32).sin()));
        for w in buffer.push(&audio) {
            calibrator.observe(&w);
        }

        assert_eq!(calibrator.phase(), CalibrationPhase::Done);
        let thresholds = calibrator.finish().unwrap();
        assert_eq!(thresholds.min_rms, MIN_RMS_FLOOR);
        assert!(thresholds.max_cmnd <= 0.5);
    }
}
