//! # Score Follower Module
//!
//! Locates the player inside a known note sequence and tracks them through
//! it. The machine has three modes:
//!
//! - **Syncing**: the last few confirmed notes are slid across every position
//!   of the score; a good enough alignment locks.
//! - **Locked**: each note is judged against the next expected one.
//! - **Lost**: too many consecutive errors; one more note gets a quick
//!   re-lock attempt, otherwise back to syncing.
//!
//! The transitions live in the pure [`process_event`] function; the stateful
//! [`ScoreFollower`] only owns the current value and the score.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{ensure_range, FollowError, Result};
use crate::events::{MatchResult, TimingStatus};
use crate::score::Score;
use crate::tuning::Pitch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowMode {
    Syncing,
    Locked,
    Lost,
}

/// What a wrong note does to the position while locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Position holds; the player has to retry the note.
    #[default]
    Strict,
    /// Position advances anyway.
    Forgiving,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    /// Notes kept for alignment while syncing.
    pub buffer_size: usize,
    pub lock_threshold: f32,
    pub min_matches_for_lock: usize,
    pub max_consecutive_errors: u32,
    /// Notes needed for the quick re-lock out of `Lost`.
    pub relock_min_matches: usize,
    /// Count C4 and C5 as the same note.
    pub octave_equivalent: bool,
    pub error_policy: ErrorPolicy,
    /// Inter-onset deviation still reported as on time, ms.
    pub on_time_tolerance_ms: f64,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 5,
            lock_threshold: 0.7,
            min_matches_for_lock: 3,
            max_consecutive_errors: 5,
            relock_min_matches: 2,
            octave_equivalent: true,
            error_policy: ErrorPolicy::Strict,
            on_time_tolerance_ms: 150.0,
        }
    }
}

impl FollowerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(FollowError::config("follower.buffer_size", "must be > 0"));
        }
        if self.min_matches_for_lock == 0 || self.min_matches_for_lock > self.buffer_size {
            return Err(FollowError::config(
                "follower.min_matches_for_lock",
                "must be within 1..=buffer_size",
            ));
        }
        if self.relock_min_matches == 0 || self.relock_min_matches > self.buffer_size {
            return Err(FollowError::config(
                "follower.relock_min_matches",
                "must be within 1..=buffer_size",
            ));
        }
        if self.max_consecutive_errors == 0 {
            return Err(FollowError::config("follower.max_consecutive_errors", "must be > 0"));
        }
        ensure_range("follower.lock_threshold", self.lock_threshold, 0.0, 1.0)?;
        if !self.on_time_tolerance_ms.is_finite() || self.on_time_tolerance_ms < 0.0 {
            return Err(FollowError::config("follower.on_time_tolerance_ms", "must be >= 0"));
        }
        Ok(())
    }

    fn same_note(&self, played: Pitch, expected: Pitch) -> bool {
        if self.octave_equivalent {
            played.same_class(expected)
        } else {
            played == expected
        }
    }
}

/// Progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FollowerState {
    pub mode: FollowMode,
    /// Index of the last matched note; `None` until first locked.
    pub position: Option<usize>,
    pub confidence: f32,
    pub consecutive_errors: u32,
}

impl Default for FollowerState {
    fn default() -> Self {
        Self {
            mode: FollowMode::Syncing,
            position: None,
            confidence: 0.0,
            consecutive_errors: 0,
        }
    }
}

/// Full machine value: the public snapshot plus the working buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowerMachine {
    pub state: FollowerState,
    buffer: VecDeque<Pitch>,
    /// `onset - expected_time` of the last matched note.
    anchor_ms: Option<f64>,
    /// Position before the last loss; breaks re-lock ties.
    last_position: Option<usize>,
    finished: bool,
}

impl FollowerMachine {
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FollowerInput {
    /// A confirmed note.
    Note { pitch: Pitch, onset_ms: f64 },
    /// Start over from syncing.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FollowerOutput {
    Match(MatchResult),
    /// Emitted whenever the snapshot changed.
    State(FollowerState),
    /// The final note of the score was reached; sent once.
    Finished,
}

/// One transition of the follower.
pub fn process_event(
    mut machine: FollowerMachine,
    input: FollowerInput,
    score: &Score,
    config: &FollowerConfig,
) -> (FollowerMachine, Vec<FollowerOutput>) {
    let (pitch, onset_ms) = match input {
        FollowerInput::Reset => {
            let fresh = FollowerMachine::default();
            let outputs = vec![FollowerOutput::State(fresh.state)];
            return (fresh, outputs);
        }
        FollowerInput::Note { pitch, onset_ms } => (pitch, onset_ms),
    };
    if machine.finished || score.is_empty() {
        return (machine, Vec::new());
    }

    let before = machine.state;
    let mut outputs = Vec::new();

    match machine.state.mode {
        FollowMode::Syncing => {
            push_bounded(&mut machine.buffer, pitch, config.buffer_size);
            if machine.buffer.len() >= config.min_matches_for_lock {
                try_lock(&mut machine, onset_ms, score, config, None, &mut outputs);
            }
        }
        FollowMode::Locked => {
            push_bounded(&mut machine.buffer, pitch, config.buffer_size);
            judge(&mut machine, pitch, onset_ms, score, config, &mut outputs);
        }
        FollowMode::Lost => {
            push_bounded(&mut machine.buffer, pitch, config.buffer_size);
            let near = machine.last_position;
            let locked = machine.buffer.len() >= config.relock_min_matches
                && try_lock(&mut machine, onset_ms, score, config, near, &mut outputs);
            if !locked {
                log::debug!("[FOLLOW] re-lock failed, back to syncing");
                machine.state = FollowerState::default();
                machine.anchor_ms = None;
            }
        }
    }

    if machine.state != before {
        outputs.push(FollowerOutput::State(machine.state));
    }
    if machine.state.mode == FollowMode::Locked
        && machine.state.position == Some(score.len() - 1)
        && !machine.finished
    {
        machine.finished = true;
        outputs.push(FollowerOutput::Finished);
    }
    (machine, outputs)
}

fn push_bounded(buffer: &mut VecDeque<Pitch>, pitch: Pitch, cap: usize) {
    if buffer.len() == cap {
        buffer.pop_front();
    }
    buffer.push_back(pitch);
}

/// Locks at the best alignment if it clears the threshold.
fn try_lock(
    machine: &mut FollowerMachine,
    onset_ms: f64,
    score: &Score,
    config: &FollowerConfig,
    near: Option<usize>,
    outputs: &mut Vec<FollowerOutput>,
) -> bool {
    let buffer: Vec<Pitch> = machine.buffer.iter().copied().collect();
    let Some((position, value)) = best_alignment(&buffer, score, config, near) else {
        return false;
    };
    if value < config.lock_threshold {
        return false;
    }

    let Some(expected) = score.get(position) else {
        return false;
    };
    log::debug!("[FOLLOW] locked at {position} (alignment {value:.2})");
    machine.state = FollowerState {
        mode: FollowMode::Locked,
        position: Some(position),
        confidence: value,
        consecutive_errors: 0,
    };
    machine.anchor_ms = Some(onset_ms - expected.expected_time_ms);
    let detected = buffer.last().copied().unwrap_or(expected.pitch);
    outputs.push(FollowerOutput::Match(MatchResult {
        matched: true,
        note_index: Some(position),
        detected,
        timing_status: TimingStatus::OnTime,
        timing_error_ms: 0,
    }));
    true
}

/// Judges one note against `sequence[position + 1]`.
fn judge(
    machine: &mut FollowerMachine,
    pitch: Pitch,
    onset_ms: f64,
    score: &Score,
    config: &FollowerConfig,
    outputs: &mut Vec<FollowerOutput>,
) {
    let next = machine.state.position.map_or(0, |p| p + 1);
    let Some(expected) = score.get(next) else {
        return;
    };

    let error_ms = machine
        .anchor_ms
        .map_or(0.0, |anchor| onset_ms - (anchor + expected.expected_time_ms));
    let correct = config.same_note(pitch, expected.pitch);
    outputs.push(FollowerOutput::Match(MatchResult {
        matched: correct,
        note_index: Some(next),
        detected: pitch,
        timing_status: TimingStatus::classify(error_ms, config.on_time_tolerance_ms),
        timing_error_ms: error_ms.round() as i64,
    }));

    let state = &mut machine.state;
    if correct {
        state.position = Some(next);
        state.consecutive_errors = 0;
        state.confidence = (state.confidence + 0.1).min(1.0);
        machine.anchor_ms = Some(onset_ms - expected.expected_time_ms);
        return;
    }

    state.consecutive_errors += 1;
    state.confidence = (state.confidence - 0.1).max(0.0);
    if config.error_policy == ErrorPolicy::Forgiving {
        state.position = Some(next);
    }
    if state.consecutive_errors >= config.max_consecutive_errors {
        log::debug!(
            "[FOLLOW] lost after {} consecutive errors at {:?}",
            state.consecutive_errors,
            state.position
        );
        state.mode = FollowMode::Lost;
        state.confidence = 0.0;
        machine.last_position = state.position;
        machine.buffer.clear();
        machine.buffer.push_back(pitch);
    }
}

/// Recency-weighted fraction of notes in `buffer` that match the score when
/// its newest note sits at `end`. Slots before the start of the score count
/// as misses.
pub fn alignment_score(buffer: &[Pitch], score: &Score, end: usize, config: &FollowerConfig) -> f32 {
    let len = buffer.len();
    let mut total = 0.0;
    let mut hit = 0.0;
    for (i, &played) in buffer.iter().enumerate() {
        let weight = (i + 1) as f32;
        total += weight;
        let back = len - 1 - i;
        if let Some(expected) = end.checked_sub(back).and_then(|idx| score.get(idx)) {
            if config.same_note(played, expected.pitch) {
                hit += weight;
            }
        }
    }
    if total > 0.0 { hit / total } else { 0.0 }
}

/// Best alignment end position and its score. Ties go to the position
/// closest to `near`, or the earliest one.
fn best_alignment(
    buffer: &[Pitch],
    score: &Score,
    config: &FollowerConfig,
    near: Option<usize>,
) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for end in 0..score.len() {
        let value = alignment_score(buffer, score, end, config);
        let better = match best {
            None => true,
            Some((best_end, best_value)) => {
                value > best_value
                    || (value == best_value
                        && near.is_some_and(|n| end.abs_diff(n) < best_end.abs_diff(n)))
            }
        };
        if better {
            best = Some((end, value));
        }
    }
    best
}

/// Stateful wrapper that owns the machine and the shared score.
#[derive(Debug, Clone)]
pub struct ScoreFollower {
    config: FollowerConfig,
    score: Arc<Score>,
    machine: FollowerMachine,
}

impl ScoreFollower {
    pub fn new(score: Arc<Score>, config: FollowerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            score,
            machine: FollowerMachine::default(),
        })
    }

    pub fn state(&self) -> FollowerState {
        self.machine.state
    }

    pub fn is_finished(&self) -> bool {
        self.machine.is_finished()
    }

    pub fn score(&self) -> &Arc<Score> {
        &self.score
    }

    /// Feeds one confirmed note.
    pub fn process(&mut self, pitch: Pitch, onset_ms: f64) -> Vec<FollowerOutput> {
        self.step(FollowerInput::Note { pitch, onset_ms })
    }

    pub fn reset(&mut self) -> Vec<FollowerOutput> {
        self.step(FollowerInput::Reset)
    }

    /// Swaps the score and starts over.
    pub fn set_score(&mut self, score: Arc<Score>) -> Vec<FollowerOutput> {
        self.score = score;
        self.reset()
    }

    fn step(&mut self, input: FollowerInput) -> Vec<FollowerOutput> {
        let machine = std::mem::take(&mut self.machine);
        let (machine, outputs) = process_event(machine, input, &self.score, &self.config);
        self.machine = machine;
        outputs
    }
}
