//! # Hysteresis Gate Module
//!
//! Turns the raw per-window `(pitch, confidence)` stream into stable note
//! changes, and wraps that in a two-speed emitter that gives the UI an instant
//! tentative event and the scorer a confirmed one.
//!
//! ## Features
//! - Frame-count hysteresis: 2 frames by default, 3 within two semitones,
//!   8 frames at confidence >= 0.85 for exact one- or two-octave jumps
//! - Silence is a candidate like any other pitch, so note-off is gated too
//! - Re-strike detection from an RMS spike, or an onset on the sounding note
//!   while its level rises
//! - Tentative / confirmed / cancelled / released signal stream with
//!   correlated event ids

use serde::{Deserialize, Serialize};

use crate::error::{ensure_positive, ensure_range, FollowError, Result};
use crate::events::{EventKind, IdAllocator, NoteEvent, NoteSignal, NoteSource};
use crate::tuning::Pitch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Consecutive frames needed for an ordinary change.
    pub default_frames: usize,
    /// Frames needed for a jump of exactly one or two octaves.
    pub octave_frames: usize,
    /// Each of those frames must be at least this confident.
    pub octave_min_confidence: f32,
    /// Frames needed for a change of at most `near_semitones`.
    pub near_frames: usize,
    pub near_semitones: u32,
    /// RMS ratio to the previous frame that counts as a re-strike.
    pub onset_ratio: f32,
    /// Frames a note must have sounded before a re-strike is accepted.
    pub restrike_holdoff_frames: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_frames: 2,
            octave_frames: 8,
            octave_min_confidence: 0.85,
            near_frames: 3,
            near_semitones: 2,
            onset_ratio: 1.3,
            restrike_holdoff_frames: 4,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, frames) in [
            ("gate.default_frames", self.default_frames),
            ("gate.octave_frames", self.octave_frames),
            ("gate.near_frames", self.near_frames),
        ] {
            if frames == 0 {
                return Err(FollowError::config(field, "must be > 0"));
            }
        }
        ensure_range("gate.octave_min_confidence", self.octave_min_confidence, 0.0, 1.0)?;
        ensure_positive("gate.onset_ratio", self.onset_ratio)?;
        if self.onset_ratio <= 1.0 {
            return Err(FollowError::config("gate.onset_ratio", "must be > 1"));
        }
        Ok(())
    }

    /// Frames (and per-frame confidence floor) needed to move from `active`
    /// to `candidate`.
    fn requirement(&self, active: Option<Pitch>, candidate: Option<Pitch>) -> (usize, f32) {
        let (Some(active), Some(candidate)) = (active, candidate) else {
            return (self.default_frames, 0.0);
        };
        let distance = active.semitones_to(candidate).unsigned_abs();
        if distance == 12 || distance == 24 {
            (self.octave_frames, self.octave_min_confidence)
        } else if distance <= self.near_semitones {
            (self.near_frames, 0.0)
        } else {
            (self.default_frames, 0.0)
        }
    }
}

/// One window's worth of evidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateFrame {
    /// `None` is silence / no detection.
    pub pitch: Option<Pitch>,
    pub confidence: f32,
    pub rms: f32,
    /// Onset strength if the onset detector fired on this window.
    pub onset: Option<f32>,
}

impl GateFrame {
    pub fn silence(rms: f32) -> Self {
        Self {
            pitch: None,
            confidence: 0.0,
            rms,
            onset: None,
        }
    }
}

/// What one frame did to the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GateStep {
    /// The sounding note was struck again and has been cleared.
    pub restruck: bool,
    /// This frame started a new candidate run.
    pub new_candidate: bool,
    /// The gate accepted a change; `Some(None)` is a note-off.
    pub accepted: Option<Option<Pitch>>,
}

/// Frame-count hysteresis over the detected pitch.
#[derive(Debug, Clone)]
pub struct HysteresisGate {
    config: GateConfig,
    active: Option<Pitch>,
    candidate: Option<Option<Pitch>>,
    run: usize,
    held_frames: usize,
    prev_rms: f32,
}

impl HysteresisGate {
    pub fn new(config: GateConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            active: None,
            candidate: None,
            run: 0,
            held_frames: 0,
            prev_rms: 0.0,
        })
    }

    pub fn active(&self) -> Option<Pitch> {
        self.active
    }

    /// Pitch of the current candidate run, if one is building.
    pub fn candidate(&self) -> Option<Option<Pitch>> {
        self.candidate
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Changes the re-strike ratio (calibration output) without losing state.
    pub fn set_onset_ratio(&mut self, ratio: f32) -> Result<()> {
        let config = GateConfig {
            onset_ratio: ratio,
            ..self.config.clone()
        };
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Makes `pitch` the active note without waiting for the run.
    pub fn force_active(&mut self, pitch: Option<Pitch>) {
        self.active = pitch;
        self.candidate = None;
        self.run = 0;
        self.held_frames = 0;
    }

    pub fn reset(&mut self) {
        self.force_active(None);
        self.prev_rms = 0.0;
    }

    pub fn push(&mut self, frame: &GateFrame) -> GateStep {
        let mut step = GateStep::default();

        if let Some(active) = self.active {
            if frame.pitch == Some(active) && self.held_frames >= self.config.restrike_holdoff_frames {
                let spike = self.prev_rms > f32::EPSILON
                    && frame.rms / self.prev_rms > self.config.onset_ratio;
                // An onset only counts while the level is rising; a note cut
                // off into silence also trips the onset measure.
                let struck = frame.onset.is_some() && frame.rms > self.prev_rms;
                if spike || struck {
                    log::trace!("[GATE] re-strike on {active}");
                    self.force_active(None);
                    step.restruck = true;
                }
            }
        }
        self.prev_rms = frame.rms;

        if frame.pitch == self.active {
            self.candidate = None;
            self.run = 0;
            self.held_frames += 1;
            return step;
        }

        if self.candidate != Some(frame.pitch) {
            self.candidate = Some(frame.pitch);
            self.run = 0;
            step.new_candidate = true;
        }

        let (needed, min_confidence) = self.config.requirement(self.active, frame.pitch);
        if frame.confidence < min_confidence {
            self.run = 0;
        } else {
            self.run += 1;
        }

        if self.run >= needed {
            self.force_active(frame.pitch);
            step.accepted = Some(frame.pitch);
        }
        step
    }
}

/// When a tentative note becomes confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum ConfirmPolicy {
    /// As soon as the hysteresis gate accepts the change.
    #[default]
    Hysteresis,
    /// After the candidate has been stable for `ms`.
    Delay { ms: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    pub gate: GateConfig,
    pub policy: ConfirmPolicy,
    pub source: NoteSource,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            policy: ConfirmPolicy::Hysteresis,
            source: NoteSource::Monophonic,
        }
    }
}

impl EmitterConfig {
    pub fn validate(&self) -> Result<()> {
        self.gate.validate()?;
        if let ConfirmPolicy::Delay { ms } = self.policy {
            if !ms.is_finite() || ms < 0.0 {
                return Err(FollowError::config("emitter.confirm_delay_ms", "must be >= 0"));
            }
        }
        Ok(())
    }
}

/// A tentative note waiting for confirmation.
#[derive(Debug, Clone)]
struct Pending {
    event: NoteEvent,
}

/// A confirmed note that has not been released yet.
#[derive(Debug, Clone, Copy)]
struct Sounding {
    id: u64,
    pitch: Pitch,
}

/// Two-speed note emission on top of [`HysteresisGate`].
#[derive(Debug)]
pub struct TwoSpeedEmitter {
    gate: HysteresisGate,
    policy: ConfirmPolicy,
    source: NoteSource,
    ids: IdAllocator,
    pending: Option<Pending>,
    sounding: Option<Sounding>,
}

impl TwoSpeedEmitter {
    pub fn new(config: EmitterConfig) -> Result<Self> {
        Self::with_ids(config, IdAllocator::new())
    }

    /// Like [`TwoSpeedEmitter::new`], drawing ids from a shared allocator.
    pub fn with_ids(config: EmitterConfig, ids: IdAllocator) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            gate: HysteresisGate::new(config.gate)?,
            policy: config.policy,
            source: config.source,
            ids,
            pending: None,
            sounding: None,
        })
    }

    pub fn gate(&self) -> &HysteresisGate {
        &self.gate
    }

    pub fn set_onset_ratio(&mut self, ratio: f32) -> Result<()> {
        self.gate.set_onset_ratio(ratio)
    }

    /// Pitch of the confirmed note currently sounding.
    pub fn sounding(&self) -> Option<Pitch> {
        self.sounding.map(|s| s.pitch)
    }

    /// Feeds one frame stamped `time_ms` on the exercise clock.
    pub fn push(&mut self, time_ms: f64, frame: &GateFrame) -> Vec<NoteSignal> {
        let mut out = Vec::new();
        let step = self.gate.push(frame);

        if step.restruck {
            self.release(time_ms, &mut out);
        }

        if step.new_candidate {
            self.cancel_pending(&mut out);
            if let Some(pitch) = frame.pitch {
                let event = NoteEvent {
                    id: self.ids.next_id(),
                    pitch,
                    onset_ms: time_ms,
                    offset_ms: None,
                    velocity: None,
                    confidence: frame.confidence,
                    onset_strength: frame.onset,
                    source: self.source,
                    kind: EventKind::Tentative,
                };
                out.push(NoteSignal::Tentative(event.clone()));
                self.pending = Some(Pending { event });
            }
        } else if let Some(pending) = self.pending.as_mut() {
            if frame.pitch == Some(pending.event.pitch) {
                pending.event.confidence = pending.event.confidence.max(frame.confidence);
                if pending.event.onset_strength.is_none() {
                    pending.event.onset_strength = frame.onset;
                }
            }
        }

        match self.policy {
            ConfirmPolicy::Hysteresis => {
                if let Some(accepted) = step.accepted {
                    self.release(time_ms, &mut out);
                    if accepted.is_some() {
                        self.confirm_pending(&mut out);
                    }
                }
            }
            ConfirmPolicy::Delay { ms } => {
                if step.accepted == Some(None) {
                    self.release(time_ms, &mut out);
                }
                let due = self.pending.as_ref().is_some_and(|p| {
                    frame.pitch == Some(p.event.pitch) && time_ms - p.event.onset_ms >= ms
                });
                if due {
                    self.release(time_ms, &mut out);
                    let pitch = self.pending.as_ref().map(|p| p.event.pitch);
                    if self.gate.active() != pitch {
                        self.gate.force_active(pitch);
                    }
                    self.confirm_pending(&mut out);
                }
            }
        }

        // A tentative note survives only while the gate still backs it.
        let backed = self.pending.as_ref().is_none_or(|p| {
            let pitch = Some(p.event.pitch);
            self.gate.candidate() == Some(pitch) || self.gate.active() == pitch
        });
        if !backed {
            self.cancel_pending(&mut out);
        }

        out
    }

    /// Ends the stream: cancels any tentative note, releases the sounding one.
    pub fn flush(&mut self, time_ms: f64) -> Vec<NoteSignal> {
        let mut out = Vec::new();
        self.cancel_pending(&mut out);
        self.release(time_ms, &mut out);
        self.gate.reset();
        out
    }

    fn confirm_pending(&mut self, out: &mut Vec<NoteSignal>) {
        if let Some(pending) = self.pending.take() {
            let confirmed = pending.event.confirmed();
            self.sounding = Some(Sounding {
                id: confirmed.id,
                pitch: confirmed.pitch,
            });
            out.push(NoteSignal::Confirmed(confirmed));
        }
    }

    fn cancel_pending(&mut self, out: &mut Vec<NoteSignal>) {
        if let Some(pending) = self.pending.take() {
            out.push(NoteSignal::Cancelled {
                id: pending.event.id,
                pitch: pending.event.pitch,
            });
        }
    }

    fn release(&mut self, time_ms: f64, out: &mut Vec<NoteSignal>) {
        if let Some(sounding) = self.sounding.take() {
            out.push(NoteSignal::Released {
                id: sounding.id,
                pitch: sounding.pitch,
                offset_ms: time_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(name: &str, confidence: f32) -> GateFrame {
        GateFrame {
            pitch: Some(name.parse().unwrap()),
            confidence,
            rms: 0.1,
            onset: None,
        }
    }

    fn gate_on(name: &str) -> HysteresisGate {
        let mut gate = HysteresisGate::new(GateConfig::default()).unwrap();
        gate.push(&note(name, 0.95));
        gate.push(&note(name, 0.95));
        assert_eq!(gate.active(), Some(name.parse().unwrap()));
        gate
    }

    #[test]
    fn octave_jump_needs_eight_confident_frames() {
        let mut gate = gate_on("A4");
        let a5: Pitch = "A5".parse().unwrap();

        for run in 1..8 {
            for _ in 0..run {
                assert_eq!(gate.push(&note("A5", 0.95)).accepted, None);
            }
            gate.push(&note("A4", 0.95));
            assert_eq!(gate.active(), Some(Pitch::A4));
        }

        let mut accepted = None;
        for _ in 0..8 {
            accepted = gate.push(&note("A5", 0.9)).accepted;
        }
        assert_eq!(accepted, Some(Some(a5)));
    }

    #[test]
    fn a_weak_frame_restarts_the_octave_run() {
        let mut gate = gate_on("A4");
        for _ in 0..7 {
            gate.push(&note("A5", 0.9));
        }
        gate.push(&note("A5", 0.8));
        for _ in 0..7 {
            gate.push(&note("A5", 0.9));
        }
        assert_eq!(gate.active(), Some(Pitch::A4));
        assert!(gate.push(&note("A5", 0.9)).accepted.is_some());
    }

    #[test]
    fn near_and_far_changes() {
        let mut gate = gate_on("A4");
        assert_eq!(gate.push(&note("B4", 0.6)).accepted, None);
        assert_eq!(gate.push(&note("B4", 0.6)).accepted, None);
        assert!(gate.push(&note("B4", 0.6)).accepted.is_some());

        let mut gate = gate_on("A4");
        assert_eq!(gate.push(&note("E5", 0.6)).accepted, None);
        assert!(gate.push(&note("E5", 0.6)).accepted.is_some());
    }

    #[test]
    fn silence_is_gated_like_a_note() {
        let mut gate = gate_on("C4");
        assert_eq!(gate.push(&GateFrame::silence(0.0)).accepted, None);
        assert_eq!(gate.push(&GateFrame::silence(0.0)).accepted, Some(None));
        assert_eq!(gate.active(), None);
    }

    #[test]
    fn rms_spike_on_the_active_note_is_a_restrike() {
        let mut gate = gate_on("C4");
        for _ in 0..4 {
            assert!(!gate.push(&note("C4", 0.9)).restruck);
        }
        let mut loud = note("C4", 0.9);
        loud.rms = 0.2;
        let step = gate.push(&loud);
        assert!(step.restruck);
        assert!(step.new_candidate);
        assert_eq!(gate.active(), None);
    }

    #[test]
    fn onset_on_a_falling_level_is_not_a_restrike() {
        let mut gate = gate_on("C4");
        for _ in 0..4 {
            gate.push(&note("C4", 0.9));
        }
        let mut fading = note("C4", 0.9);
        fading.rms = 0.05;
        fading.onset = Some(1.3);
        assert!(!gate.push(&fading).restruck);
        assert_eq!(gate.active(), Some("C4".parse().unwrap()));

        let mut rising = note("C4", 0.9);
        rising.rms = 0.06;
        rising.onset = Some(2.0);
        assert!(gate.push(&rising).restruck);
    }

    fn emitter(policy: ConfirmPolicy) -> TwoSpeedEmitter {
        TwoSpeedEmitter::new(EmitterConfig {
            policy,
            ..EmitterConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn tentative_then_confirmed_then_released() {
        let mut em = emitter(ConfirmPolicy::Hysteresis);
        let first = em.push(0.0, &note("E4", 0.7));
        let [NoteSignal::Tentative(tentative)] = first.as_slice() else {
            panic!("expected one tentative, got {first:?}");
        };
        let second = em.push(12.0, &note("E4", 0.9));
        let [NoteSignal::Confirmed(confirmed)] = second.as_slice() else {
            panic!("expected one confirmed, got {second:?}");
        };
        assert_eq!(confirmed.id, tentative.id);
        assert_eq!(confirmed.onset_ms, 0.0);
        assert_eq!(confirmed.confidence, 0.9);

        assert!(em.push(24.0, &GateFrame::silence(0.0)).is_empty());
        let off = em.push(36.0, &GateFrame::silence(0.0));
        assert_eq!(
            off,
            vec![NoteSignal::Released {
                id: tentative.id,
                pitch: tentative.pitch,
                offset_ms: 36.0
            }]
        );
    }

    #[test]
    fn flicker_is_cancelled() {
        let mut em = emitter(ConfirmPolicy::Hysteresis);
        em.push(0.0, &note("A4", 0.9));
        em.push(12.0, &note("A4", 0.9));
        let flicker = em.push(24.0, &note("C5", 0.9));
        assert!(matches!(flicker.as_slice(), [NoteSignal::Tentative(_)]));
        let back = em.push(36.0, &note("A4", 0.9));
        assert!(matches!(back.as_slice(), [NoteSignal::Cancelled { .. }]));
        assert_eq!(em.sounding(), Some(Pitch::A4));
    }

    #[test]
    fn delay_policy_confirms_after_stable_time() {
        let mut em = emitter(ConfirmPolicy::Delay { ms: 80.0 });
        let mut confirmed_at = None;
        for k in 0..10 {
            let t = k as f64 * 12.0;
            for signal in em.push(t, &note("G4", 0.9)) {
                if let NoteSignal::Confirmed(e) = signal {
                    assert_eq!(e.onset_ms, 0.0);
                    confirmed_at.get_or_insert(t);
                }
            }
        }
        assert_eq!(confirmed_at, Some(84.0));
    }

    #[test]
    fn restrike_releases_and_starts_a_new_note() {
        let mut em = emitter(ConfirmPolicy::Hysteresis);
        for k in 0..6 {
            em.push(k as f64 * 12.0, &note("D4", 0.9));
        }
        let mut struck = note("D4", 0.9);
        struck.onset = Some(3.0);
        struck.rms = 0.12;
        let signals = em.push(72.0, &struck);
        assert!(matches!(signals[0], NoteSignal::Released { .. }));
        assert!(matches!(signals[1], NoteSignal::Tentative(ref e) if e.onset_strength == Some(3.0)));
        let next = em.push(84.0, &note("D4", 0.9));
        assert!(matches!(next.as_slice(), [NoteSignal::Confirmed(_)]));
    }

    #[test]
    fn flush_closes_everything() {
        let mut em = emitter(ConfirmPolicy::Hysteresis);
        em.push(0.0, &note("F4", 0.9));
        em.push(12.0, &note("F4", 0.9));
        em.push(24.0, &note("B4", 0.9));
        let end = em.flush(30.0);
        assert!(matches!(end[0], NoteSignal::Cancelled { .. }));
        assert!(matches!(end[1], NoteSignal::Released { offset_ms, .. } if offset_ms == 30.0));
    }

    #[test]
    fn bad_ratio_is_rejected() {
        let config = GateConfig {
            onset_ratio: 0.9,
            ..GateConfig::default()
        };
        assert!(HysteresisGate::new(config).is_err());
    }
}
