//! # Timed Follower Module
//!
//! Time-aware scoring: each detected note is matched against any pending
//! expected note whose target time lies inside a window around it, so the
//! player can be judged on rhythm as well as pitch.
//!
//! ## Features
//! - Closest-in-time matching within ±500 ms
//! - On time within ±150 ms, otherwise early or late
//! - Per-pitch re-match gap so one sustained key is not counted twice
//! - Missed-note sweep as time passes
//! - Tempo drift fit over the matched onsets (linear regression)

use linreg::linear_regression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FollowError, Result};
use crate::events::{MatchResult, TimingStatus};
use crate::score::{ExpectedNote, Score};
use crate::tuning::Pitch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Half-width of the matching window around a target time, ms.
    pub max_timing_window_ms: f64,
    pub on_time_tolerance_ms: f64,
    /// The same pitch cannot match again within this gap, ms.
    pub rematch_gap_ms: f64,
    pub octave_equivalent: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            max_timing_window_ms: 500.0,
            on_time_tolerance_ms: 150.0,
            rematch_gap_ms: 600.0,
            octave_equivalent: true,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<()> {
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !non_negative(self.max_timing_window_ms) || self.max_timing_window_ms == 0.0 {
            return Err(FollowError::config("timing.max_timing_window_ms", "must be > 0"));
        }
        if !non_negative(self.on_time_tolerance_ms)
            || self.on_time_tolerance_ms > self.max_timing_window_ms
        {
            return Err(FollowError::config(
                "timing.on_time_tolerance_ms",
                "must be within [0, max_timing_window_ms]",
            ));
        }
        if !non_negative(self.rematch_gap_ms) {
            return Err(FollowError::config("timing.rematch_gap_ms", "must be >= 0"));
        }
        Ok(())
    }
}

/// Where an expected note stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NoteStatus {
    Pending,
    Matched { onset_ms: f64, result: MatchResult },
    Missed,
}

/// Result of [`TimingFollower::tempo_fit`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TempoFit {
    /// Played time per score time; above 1 the player is dragging.
    pub ratio: f64,
    /// Constant offset of the fit, ms.
    pub offset_ms: f64,
    pub samples: usize,
}

impl TempoFit {
    pub fn is_rushing(&self) -> bool {
        self.ratio < 1.0
    }
}

/// Tally of every expected note's outcome so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingSummary {
    pub on_time: usize,
    pub early: usize,
    pub late: usize,
    pub missed: usize,
    pub pending: usize,
    /// Detected notes that matched nothing.
    pub extra: usize,
}

/// Matches timestamped notes against the score's target times.
#[derive(Debug, Clone)]
pub struct TimingFollower {
    config: TimingConfig,
    score: Arc<Score>,
    status: Vec<NoteStatus>,
    last_match_ms: HashMap<Pitch, f64>,
    extra: usize,
}

impl TimingFollower {
    pub fn new(score: Arc<Score>, config: TimingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            status: vec![NoteStatus::Pending; score.len()],
            config,
            score,
            last_match_ms: HashMap::new(),
            extra: 0,
        })
    }

    pub fn score(&self) -> &Arc<Score> {
        &self.score
    }

    pub fn status(&self) -> &[NoteStatus] {
        &self.status
    }

    /// Swaps in a new score and forgets all progress.
    pub fn set_score(&mut self, score: Arc<Score>) {
        self.status = vec![NoteStatus::Pending; score.len()];
        self.score = score;
        self.last_match_ms.clear();
        self.extra = 0;
    }

    fn same_note(&self, played: Pitch, expected: Pitch) -> bool {
        if self.config.octave_equivalent {
            played.same_class(expected)
        } else {
            played == expected
        }
    }

    fn pending_within(&self, onset_ms: f64) -> impl Iterator<Item = &ExpectedNote> + '_ {
        let window = self.config.max_timing_window_ms;
        self.score.notes().iter().filter(move |n| {
            matches!(self.status[n.index], NoteStatus::Pending)
                && (onset_ms - n.expected_time_ms).abs() <= window
        })
    }

    /// Judges one note played at `onset_ms` (exercise clock).
    ///
    /// # Returns
    /// * `None` - the same pitch matched less than the re-match gap ago
    /// * `Some(result)` - matched, or unmatched with the nearest pending note
    ///   in the window (any pitch) as `note_index`, if there is one
    pub fn process(&mut self, pitch: Pitch, onset_ms: f64) -> Option<MatchResult> {
        if let Some(&last) = self.last_match_ms.get(&pitch) {
            if onset_ms - last < self.config.rematch_gap_ms {
                return None;
            }
        }

        let hit = closest(
            self.pending_within(onset_ms)
                .filter(|n| self.same_note(pitch, n.pitch)),
            onset_ms,
        );
        if let Some(note) = hit {
            let error = onset_ms - note.expected_time_ms;
            let result = MatchResult {
                matched: true,
                note_index: Some(note.index),
                detected: pitch,
                timing_status: TimingStatus::classify(error, self.config.on_time_tolerance_ms),
                timing_error_ms: error.round() as i64,
            };
            self.status[note.index] = NoteStatus::Matched {
                onset_ms,
                result: result.clone(),
            };
            self.last_match_ms.insert(pitch, onset_ms);
            return Some(result);
        }

        self.extra += 1;
        let nearest = closest(self.pending_within(onset_ms), onset_ms);
        let (note_index, error) = match nearest {
            Some(note) => (Some(note.index), onset_ms - note.expected_time_ms),
            None => (None, 0.0),
        };
        Some(MatchResult {
            matched: false,
            note_index,
            detected: pitch,
            timing_status: TimingStatus::classify(error, self.config.on_time_tolerance_ms),
            timing_error_ms: error.round() as i64,
        })
    }

    /// Marks every pending note whose window closed before `now_ms` as missed
    /// and returns them.
    pub fn advance(&mut self, now_ms: f64) -> Vec<ExpectedNote> {
        let window = self.config.max_timing_window_ms;
        let mut missed = Vec::new();
        for note in self.score.notes() {
            let slot = &mut self.status[note.index];
            if matches!(slot, NoteStatus::Pending) && note.expected_time_ms + window < now_ms {
                *slot = NoteStatus::Missed;
                missed.push(*note);
            }
        }
        missed
    }

    /// True once no note is pending.
    pub fn is_complete(&self) -> bool {
        !self.status.iter().any(|s| matches!(s, NoteStatus::Pending))
    }

    /// Fits `onset = ratio · expected + offset` over the matched notes.
    ///
    /// Needs at least three matches spread over more than one target time.
    pub fn tempo_fit(&self) -> Option<TempoFit> {
        let (xs, ys): (Vec<f64>, Vec<f64>) = self
            .score
            .notes()
            .iter()
            .filter_map(|n| match &self.status[n.index] {
                NoteStatus::Matched { onset_ms, .. } => Some((n.expected_time_ms, *onset_ms)),
                _ => None,
            })
            .unzip();
        if xs.len() < 3 {
            return None;
        }

        let (ratio, offset_ms) = linear_regression::<_, _, f64>(&xs, &ys).ok()?;
        if !ratio.is_finite() || !offset_ms.is_finite() {
            return None;
        }
        Some(TempoFit {
            ratio,
            offset_ms,
            samples: xs.len(),
        })
    }

    pub fn summary(&self) -> TimingSummary {
        let mut summary = TimingSummary {
            extra: self.extra,
            ..TimingSummary::default()
        };
        for status in &self.status {
            match status {
                NoteStatus::Pending => summary.pending += 1,
                NoteStatus::Missed => summary.missed += 1,
                NoteStatus::Matched { result, .. } => match result.timing_status {
                    TimingStatus::OnTime => summary.on_time += 1,
                    TimingStatus::Early => summary.early += 1,
                    TimingStatus::Late => summary.late += 1,
                },
            }
        }
        summary
    }
}

/// The note whose target time is nearest `onset_ms`; ties go to the earlier.
fn closest<'a>(notes: impl Iterator<Item = &'a ExpectedNote>, onset_ms: f64) -> Option<ExpectedNote> {
    notes
        .min_by(|a, b| {
            (onset_ms - a.expected_time_ms)
                .abs()
                .total_cmp(&(onset_ms - b.expected_time_ms).abs())
        })
        .copied()
}
