//! # Note Events
//!
//! The immutable messages that flow from the detectors through the
//! orchestrator to the followers. Corrections are new events, never edits.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::tuning::Pitch;

/// Hands out event ids. Clones share one counter, so every detector feeding
/// the same timeline draws from it and ids never collide across sources.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator(Arc<AtomicU64>);

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Which detector produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSource {
    Monophonic,
    Polyphonic,
    Midi,
}

/// Evidence tier. There is no path from `Confirmed` back to `Tentative`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Tentative,
    Confirmed,
}

/// A detected note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// Correlates the tentative and confirmed tiers of one attack.
    pub id: u64,
    pub pitch: Pitch,
    /// Onset on the shared exercise clock, ms.
    pub onset_ms: f64,
    pub offset_ms: Option<f64>,
    pub velocity: Option<u8>,
    pub confidence: f32,
    pub onset_strength: Option<f32>,
    pub source: NoteSource,
    pub kind: EventKind,
}

impl NoteEvent {
    pub fn note_name(&self) -> String {
        self.pitch.name()
    }

    pub fn is_confirmed(&self) -> bool {
        self.kind == EventKind::Confirmed
    }

    /// A confirmed copy of this event (same id, same onset).
    pub fn confirmed(&self) -> NoteEvent {
        NoteEvent {
            kind: EventKind::Confirmed,
            ..self.clone()
        }
    }

    /// This event shifted by `offset_ms` on the clock (rebasing).
    pub fn shifted(&self, offset_ms: f64) -> NoteEvent {
        NoteEvent {
            onset_ms: self.onset_ms + offset_ms,
            offset_ms: self.offset_ms.map(|t| t + offset_ms),
            ..self.clone()
        }
    }
}

/// Output of the two-speed emitter and the chord tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoteSignal {
    /// First frame of a new candidate: instant feedback only.
    Tentative(NoteEvent),
    /// Enough evidence to score.
    Confirmed(NoteEvent),
    /// A tentative candidate died before confirmation.
    Cancelled { id: u64, pitch: Pitch },
    /// A confirmed note ended.
    Released { id: u64, pitch: Pitch, offset_ms: f64 },
}

impl NoteSignal {
    pub fn id(&self) -> u64 {
        match self {
            NoteSignal::Tentative(e) | NoteSignal::Confirmed(e) => e.id,
            NoteSignal::Cancelled { id, .. } | NoteSignal::Released { id, .. } => *id,
        }
    }

    pub fn pitch(&self) -> Pitch {
        match self {
            NoteSignal::Tentative(e) | NoteSignal::Confirmed(e) => e.pitch,
            NoteSignal::Cancelled { pitch, .. } | NoteSignal::Released { pitch, .. } => *pitch,
        }
    }

    /// Same signal with its times shifted by `offset_ms`.
    pub fn shifted(&self, offset_ms: f64) -> NoteSignal {
        match self {
            NoteSignal::Tentative(e) => NoteSignal::Tentative(e.shifted(offset_ms)),
            NoteSignal::Confirmed(e) => NoteSignal::Confirmed(e.shifted(offset_ms)),
            NoteSignal::Cancelled { .. } => self.clone(),
            NoteSignal::Released { id, pitch, offset_ms: t } => NoteSignal::Released {
                id: *id,
                pitch: *pitch,
                offset_ms: t + offset_ms,
            },
        }
    }
}

/// Timing classification of a matched note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingStatus {
    OnTime,
    Early,
    Late,
}

impl TimingStatus {
    /// `error_ms` is detected minus expected; within `±tolerance_ms` is on time.
    pub fn classify(error_ms: f64, tolerance_ms: f64) -> Self {
        if error_ms.abs() <= tolerance_ms {
            TimingStatus::OnTime
        } else if error_ms < 0.0 {
            TimingStatus::Early
        } else {
            TimingStatus::Late
        }
    }
}

/// Verdict on one incoming note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Index of the expected note this was judged against, if any.
    pub note_index: Option<usize>,
    pub detected: Pitch,
    pub timing_status: TimingStatus,
    /// Detected minus expected onset, ms (negative = early).
    pub timing_error_ms: i64,
}

impl MatchResult {
    pub fn detected_note(&self) -> String {
        self.detected.name()
    }
}
