//! # Score Module
//!
//! The expected note sequence an exercise is played against. A [`Score`] is
//! built once, validated up front, and then only shared (`Arc`) and read.
//!
//! Two input forms are accepted:
//!
//! - **Text**: whitespace separated tokens `NOTE[+NOTE...][:dur_ms | @abs_ms]`,
//!   e.g. `C4:500 D4 E4+G4@1500 R:250 F4`. `R` is a rest. Without a suffix a
//!   token lasts the default duration.
//! - **JSON**: a [`ScoreDefinition`].
//!
//! Note names are checked here, so a bad name fails at load time and never
//! mid-stream.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{FollowError, Result};
use crate::tuning::Pitch;

/// Duration of a token with no explicit length, ms.
pub const DEFAULT_NOTE_MS: f64 = 500.0;

/// One element of the expected sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedNote {
    pub pitch: Pitch,
    /// Target onset relative to the exercise start, ms.
    pub expected_time_ms: f64,
    /// Position in the sequence.
    pub index: usize,
}

impl ExpectedNote {
    pub fn note_name(&self) -> String {
        self.pitch.name()
    }
}

/// Ordered, immutable expected sequence. Chord members share a target time
/// and occupy consecutive indices.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Score {
    notes: Vec<ExpectedNote>,
}

impl Score {
    /// Builds a score from `(pitch, time)` pairs, which must be in time order.
    pub fn from_timed<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Pitch, f64)>,
    {
        let mut notes = Vec::new();
        let mut last = f64::NEG_INFINITY;
        for (index, (pitch, time)) in entries.into_iter().enumerate() {
            if !time.is_finite() || time < 0.0 {
                return Err(FollowError::InvalidScore {
                    index,
                    msg: format!("bad target time {time}"),
                });
            }
            if time < last {
                return Err(FollowError::InvalidScore {
                    index,
                    msg: format!("target time {time} ms is before the previous note ({last} ms)"),
                });
            }
            last = time;
            notes.push(ExpectedNote {
                pitch,
                expected_time_ms: time,
                index,
            });
        }
        Ok(Self { notes })
    }

    /// Evenly spaced sequence, `spacing_ms` apart from 0.
    pub fn from_pitches(pitches: &[Pitch], spacing_ms: f64) -> Self {
        let notes = pitches
            .iter()
            .enumerate()
            .map(|(index, &pitch)| ExpectedNote {
                pitch,
                expected_time_ms: index as f64 * spacing_ms,
                index,
            })
            .collect();
        Self { notes }
    }

    /// Parses the text form with a given default token duration.
    pub fn parse(text: &str, default_duration_ms: f64) -> Result<Self> {
        if !default_duration_ms.is_finite() || default_duration_ms <= 0.0 {
            return Err(FollowError::config("score.default_duration_ms", "must be > 0"));
        }

        let mut entries = Vec::new();
        let mut cursor = 0.0;
        // Target time of the previous token; absolute times may not precede it.
        let mut previous = 0.0;
        for (token_index, token) in text.split_whitespace().enumerate() {
            let (names, timing) = split_timing(token);
            let invalid = |msg: String| FollowError::InvalidScore {
                index: token_index,
                msg,
            };

            let (time, duration) = match timing {
                None => (cursor, default_duration_ms),
                Some(Timing::Duration(raw)) => {
                    let duration = parse_ms(raw).ok_or_else(|| invalid(format!("bad duration `{raw}`")))?;
                    (cursor, duration)
                }
                Some(Timing::Absolute(raw)) => {
                    let time = parse_ms(raw).ok_or_else(|| invalid(format!("bad time `{raw}`")))?;
                    if time < previous {
                        return Err(invalid(format!(
                            "time {time} ms is before the previous note ({previous} ms)"
                        )));
                    }
                    (time, default_duration_ms)
                }
            };

            if !names.eq_ignore_ascii_case("r") {
                for name in names.split('+') {
                    entries.push((name.parse::<Pitch>()?, time));
                }
            }
            previous = time;
            cursor = time + duration;
        }

        Self::from_timed(entries)
    }

    pub fn from_definition(def: &ScoreDefinition) -> Result<Self> {
        let default_duration = def.default_duration_ms.unwrap_or(DEFAULT_NOTE_MS);
        if !default_duration.is_finite() || default_duration <= 0.0 {
            return Err(FollowError::config("score.default_duration_ms", "must be > 0"));
        }

        let mut entries = Vec::new();
        let mut cursor = 0.0;
        for (index, entry) in def.notes.iter().enumerate() {
            let time = entry.time_ms.unwrap_or(cursor);
            let duration = entry.duration_ms.unwrap_or(default_duration);
            if !duration.is_finite() || duration < 0.0 {
                return Err(FollowError::InvalidScore {
                    index,
                    msg: format!("bad duration {duration}"),
                });
            }
            for name in entry.note.split('+') {
                let pitch = name.trim().parse::<Pitch>().map_err(|_| FollowError::InvalidScore {
                    index,
                    msg: format!("unparseable note name `{name}`"),
                })?;
                entries.push((pitch, time));
            }
            cursor = time + duration;
        }
        Self::from_timed(entries)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let def: ScoreDefinition = serde_json::from_str(json)?;
        Self::from_definition(&def)
    }

    /// Loads a score file: `.json` as a definition, anything else as text.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::parse(&contents, DEFAULT_NOTE_MS)
        }
    }

    pub fn notes(&self) -> &[ExpectedNote] {
        &self.notes
    }

    pub fn get(&self, index: usize) -> Option<&ExpectedNote> {
        self.notes.get(index)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn pitches(&self) -> impl Iterator<Item = Pitch> + '_ {
        self.notes.iter().map(|n| n.pitch)
    }

    /// True if two or more notes share a target time.
    pub fn has_chords(&self) -> bool {
        self.notes
            .windows(2)
            .any(|w| w[0].expected_time_ms == w[1].expected_time_ms)
    }

    /// Target time of the last note, ms.
    pub fn end_ms(&self) -> f64 {
        self.notes.last().map_or(0.0, |n| n.expected_time_ms)
    }
}

impl FromStr for Score {
    type Err = FollowError;

    fn from_str(s: &str) -> Result<Self> {
        Score::parse(s, DEFAULT_NOTE_MS)
    }
}

enum Timing<'a> {
    Duration(&'a str),
    Absolute(&'a str),
}

fn split_timing(token: &str) -> (&str, Option<Timing<'_>>) {
    if let Some((names, raw)) = token.split_once(':') {
        (names, Some(Timing::Duration(raw)))
    } else if let Some((names, raw)) = token.split_once('@') {
        (names, Some(Timing::Absolute(raw)))
    } else {
        (token, None)
    }
}

fn parse_ms(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

/// Serialized form of a score.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreDefinition {
    pub notes: Vec<ScoreEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_duration_ms: Option<f64>,
}

/// One entry of a [`ScoreDefinition`]; `note` may be a `+`-joined chord.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Absolute target time; overrides the running cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<f64>,
}

/// A score plus the metadata the orchestrator routes on.
#[derive(Debug, Clone, PartialEq)]
pub struct Exercise {
    pub name: String,
    pub score: Arc<Score>,
    pub requires_polyphony: bool,
}

impl Exercise {
    /// Polyphony is inferred from the score (any chord means polyphonic).
    pub fn new(name: impl Into<String>, score: Score) -> Self {
        let requires_polyphony = score.has_chords();
        Self {
            name: name.into(),
            score: Arc::new(score),
            requires_polyphony,
        }
    }

    pub fn with_polyphony(mut self, requires_polyphony: bool) -> Self {
        self.requires_polyphony = requires_polyphony;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let def: ExerciseDefinition = serde_json::from_str(json)?;
        let score = Score::from_definition(&def.score)?;
        let exercise = Exercise::new(def.name, score);
        Ok(match def.requires_polyphony {
            Some(flag) => exercise.with_polyphony(flag),
            None => exercise,
        })
    }
}

/// Serialized form of an [`Exercise`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_polyphony: Option<bool>,
    pub score: ScoreDefinition,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::parse_pitches;

    fn names(score: &Score) -> Vec<String> {
        score.pitches().map(|p| p.name()).collect()
    }

    #[test]
    fn text_form_with_durations_rests_and_chords() {
        let score: Score = "C4:250 D4 R:100 E4+G4 A4@2000".parse().unwrap();
        assert_eq!(names(&score), ["C4", "D4", "E4", "G4", "A4"]);
        let times: Vec<f64> = score.notes().iter().map(|n| n.expected_time_ms).collect();
        assert_eq!(times, [0.0, 250.0, 850.0, 850.0, 2000.0]);
        let indices: Vec<usize> = score.notes().iter().map(|n| n.index).collect();
        assert_eq!(indices, [0, 1, 2, 3, 4]);
        assert!(score.has_chords());
        assert_eq!(score.end_ms(), 2000.0);
    }

    #[test]
    fn bad_names_fail_fast() {
        assert!(matches!(
            "C4 H4 E4".parse::<Score>(),
            Err(FollowError::InvalidNoteName(name)) if name == "H4"
        ));
        assert!(matches!(
            "C4:abc".parse::<Score>(),
            Err(FollowError::InvalidScore { index: 0, .. })
        ));
        assert!(matches!(
            "C4@1000 D4@500".parse::<Score>(),
            Err(FollowError::InvalidScore { index: 1, .. })
        ));
    }

    #[test]
    fn json_definition() {
        let json = r#"{
            "default_duration_ms": 400,
            "notes": [
                {"note": "C4"},
                {"note": "E4+G4", "duration_ms": 800},
                {"note": "C5", "time_ms": 2000}
            ]
        }"#;
        let score = Score::from_json_str(json).unwrap();
        let times: Vec<f64> = score.notes().iter().map(|n| n.expected_time_ms).collect();
        assert_eq!(times, [0.0, 400.0, 400.0, 2000.0]);

        let bad = r#"{"notes": [{"note": "C4"}, {"note": "X9"}]}"#;
        assert!(matches!(
            Score::from_json_str(bad),
            Err(FollowError::InvalidScore { index: 1, .. })
        ));
    }

    #[test]
    fn exercise_infers_polyphony() {
        let mono = Exercise::new("scale", "C4 D4 E4".parse().unwrap());
        assert!(!mono.requires_polyphony);
        let poly = Exercise::new("triads", "C4+E4+G4 F4+A4+C5".parse().unwrap());
        assert!(poly.requires_polyphony);

        let json = r#"{"name": "forced", "requires_polyphony": true, "score": {"notes": [{"note": "C4"}]}}"#;
        let forced = Exercise::from_json_str(json).unwrap();
        assert!(forced.requires_polyphony);
        assert_eq!(forced.score.len(), 1);
    }

    #[test]
    fn evenly_spaced_from_pitch_list() {
        let pitches = parse_pitches(&["C4", "E4", "G4"]).unwrap();
        let score = Score::from_pitches(&pitches, 400.0);
        assert_eq!(names(&score), ["C4", "E4", "G4"]);
        assert_eq!(score.get(2).unwrap().expected_time_ms, 800.0);
        assert!(parse_pitches(&["C4", "H4"]).is_err());
    }

    #[test]
    fn absolute_times_closer_than_the_default_duration() {
        let score: Score = "C4@0 D4@250 E4@500".parse().unwrap();
        let times: Vec<f64> = score.notes().iter().map(|n| n.expected_time_ms).collect();
        assert_eq!(times, [0.0, 250.0, 500.0]);

        let repeated: Score = "G4@0 G4@400".parse().unwrap();
        assert_eq!(repeated.get(1).unwrap().expected_time_ms, 400.0);

        // Same target time is a chord written out; earlier is an error.
        assert!("C4@300 E4@300".parse::<Score>().is_ok());
        assert!(matches!(
            "C4@300 E4@200".parse::<Score>(),
            Err(FollowError::InvalidScore { index: 1, .. })
        ));
    }

    #[test]
    fn text_and_json_agree_on_absolute_times() {
        let text: Score = "C4@0 D4@250".parse().unwrap();
        let json = r#"{"notes": [{"note": "C4", "time_ms": 0}, {"note": "D4", "time_ms": 250}]}"#;
        let def: ScoreDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(Score::from_definition(&def).unwrap(), text);
    }
}
