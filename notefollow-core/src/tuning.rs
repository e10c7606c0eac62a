//! # Musical Tuning Module
//!
//! Note identity for the whole crate. Detectors, followers and scores all speak
//! [`Pitch`] (a MIDI note number); note-name strings only appear when parsing a
//! score or printing a result.
//!
//! ## Features
//! - 88-key piano note table (A0 to C8), equal temperament, A4 = 440 Hz
//! - Frequency <-> MIDI conversion
//! - Note name parsing (`C4`, `C#4`, `Db4`, `B-1`) and formatting
//! - Cent deviation calculations

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FollowError;

/// Sharp spellings used when formatting a pitch class.
const PITCH_CLASS_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Lowest key on an 88-key piano (A0).
pub const PIANO_LOWEST: u8 = 21;
/// Highest key on an 88-key piano (C8).
pub const PIANO_HIGHEST: u8 = 108;

/// A single musical note: MIDI number in `0..=127`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Pitch(u8);

impl Pitch {
    /// Middle A, 440 Hz.
    pub const A4: Pitch = Pitch(69);

    /// Builds a pitch from a MIDI number, rejecting values above 127.
    pub fn new(midi: u8) -> Result<Self, FollowError> {
        if midi <= 127 {
            Ok(Pitch(midi))
        } else {
            Err(FollowError::InvalidNoteName(format!("midi {midi}")))
        }
    }

    /// Nearest MIDI pitch to `freq`: `round(12·log2(f/440) + 69)`.
    ///
    /// Returns `None` for non-positive, non-finite or out-of-range input.
    pub fn from_frequency(freq: f32) -> Option<Self> {
        if !freq.is_finite() || freq <= 0.0 {
            return None;
        }
        let midi = (12.0 * (freq / 440.0).log2() + 69.0).round();
        if (0.0..=127.0).contains(&midi) {
            Some(Pitch(midi as u8))
        } else {
            None
        }
    }

    pub fn midi(self) -> u8 {
        self.0
    }

    /// Equal-tempered frequency in Hz.
    pub fn frequency(self) -> f32 {
        440.0 * 2.0_f32.powf((self.0 as f32 - 69.0) / 12.0)
    }

    /// Pitch class, 0 = C ... 11 = B.
    pub fn pitch_class(self) -> u8 {
        self.0 % 12
    }

    /// Scientific octave number (C4 = middle C, MIDI 0 is C-1).
    pub fn octave(self) -> i8 {
        (self.0 / 12) as i8 - 1
    }

    /// True when both pitches share a pitch class (octave equivalence).
    pub fn same_class(self, other: Pitch) -> bool {
        self.pitch_class() == other.pitch_class()
    }

    /// Signed distance in semitones from `self` to `other`.
    pub fn semitones_to(self, other: Pitch) -> i32 {
        other.0 as i32 - self.0 as i32
    }

    /// True for A0..=C8.
    pub fn is_piano_key(self) -> bool {
        (PIANO_LOWEST..=PIANO_HIGHEST).contains(&self.0)
    }

    /// Display name with sharps, e.g. `C#4`.
    pub fn name(self) -> String {
        format!(
            "{}{}",
            PITCH_CLASS_NAMES[self.pitch_class() as usize],
            self.octave()
        )
    }
}

impl From<Pitch> for u8 {
    fn from(p: Pitch) -> u8 {
        p.0
    }
}

impl TryFrom<u8> for Pitch {
    type Error = FollowError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Pitch::new(value)
    }
}

impl fmt::Display for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Pitch {
    type Err = FollowError;

    /// Parses `<letter>[#|b]*<octave>`; the octave may be negative (`C-1`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FollowError::InvalidNoteName(s.to_string());
        let trimmed = s.trim();
        let mut chars = trimmed.chars();

        let base: i32 = match chars.next().map(|c| c.to_ascii_uppercase()) {
            Some('C') => 0,
            Some('D') => 2,
            Some('E') => 4,
            Some('F') => 5,
            Some('G') => 7,
            Some('A') => 9,
            Some('B') => 11,
            _ => return Err(invalid()),
        };

        let rest = chars.as_str();
        let accidental_len = rest
            .char_indices()
            .find(|&(_, c)| c != '#' && c != 'b')
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (accidentals, octave_str) = rest.split_at(accidental_len);
        let shift: i32 = accidentals
            .chars()
            .map(|c| if c == '#' { 1 } else { -1 })
            .sum();

        if octave_str.is_empty() {
            return Err(invalid());
        }
        let octave: i32 = octave_str.parse().map_err(|_| invalid())?;
        let midi = (octave + 1) * 12 + base + shift;
        if (0..=127).contains(&midi) {
            Ok(Pitch(midi as u8))
        } else {
            Err(invalid())
        }
    }
}

/// Represents a single piano key with its name and frequency.
#[derive(Debug, Clone)]
pub struct Note {
    /// The key's pitch.
    pub pitch: Pitch,
    /// Frequency in Hz
    pub frequency: f32,
}

/// Statically computed notes for a standard 88-key piano (A0 to C8).
///
/// Computed once on first use with A4 = 440 Hz.
static PIANO_KEYS: Lazy<Vec<Note>> = Lazy::new(|| {
    (PIANO_LOWEST..=PIANO_HIGHEST)
        .map(|midi| {
            let pitch = Pitch(midi);
            Note {
                pitch,
                frequency: pitch.frequency(),
            }
        })
        .collect()
});

/// Finds the piano key closest to `freq`.
///
/// Unlike [`Pitch::from_frequency`] this is clamped to the keyboard, so a
/// 20 Hz rumble maps to A0 rather than to nothing.
pub fn find_nearest_note(freq: f32) -> (Pitch, f32) {
    let closest = PIANO_KEYS
        .iter()
        .min_by(|a, b| {
            let diff_a = (a.frequency - freq).abs();
            let diff_b = (b.frequency - freq).abs();
            diff_a
                .partial_cmp(&diff_b)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|n| (n.pitch, n.frequency));

    // The table is never empty; A4 keeps the signature infallible.
    closest.unwrap_or((Pitch::A4, 440.0))
}

/// Looks a key up by its 88-key index (0 = A0, 87 = C8).
pub fn piano_key(key_index: u8) -> Option<&'static Note> {
    PIANO_KEYS.get(key_index as usize)
}

/// Calculates the deviation from a target frequency in cents.
///
/// 100 cents = 1 semitone; positive is sharp, negative is flat.
pub fn calculate_cents_deviation(freq: f32, target_freq: f32) -> f32 {
    1200.0 * (freq / target_freq).log2()
}

/// Parses a whitespace-free list of names such as `["C4", "E4"]`.
pub fn parse_pitches<S: AsRef<str>>(names: &[S]) -> Result<Vec<Pitch>, FollowError> {
    names.iter().map(|n| n.as_ref().parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sharps_flats_and_negative_octaves() {
        assert_eq!("C4".parse::<Pitch>().unwrap().midi(), 60);
        assert_eq!("C#4".parse::<Pitch>().unwrap().midi(), 61);
        assert_eq!("Db4".parse::<Pitch>().unwrap().midi(), 61);
        assert_eq!("a0".parse::<Pitch>().unwrap().midi(), 21);
        assert_eq!("C-1".parse::<Pitch>().unwrap().midi(), 0);
        assert_eq!("Cb4".parse::<Pitch>().unwrap().midi(), 59);
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["", "H4", "C", "C#", "4C", "C4x", "G#9", "C##"] {
            assert!(bad.parse::<Pitch>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn names_round_trip_through_display() {
        let p: Pitch = "F#3".parse().unwrap();
        assert_eq!(p.to_string(), "F#3");
        assert_eq!(p.octave(), 3);
        assert_eq!(p.pitch_class(), 6);
    }

    #[test]
    fn frequency_mapping_matches_equal_temperament() {
        assert_eq!(Pitch::from_frequency(440.0), Some(Pitch::A4));
        assert_eq!(Pitch::from_frequency(261.63).unwrap().midi(), 60);
        assert_eq!(Pitch::from_frequency(0.0), None);
        assert!((Pitch::A4.frequency() - 440.0).abs() < 1e-3);
    }

    #[test]
    fn nearest_piano_key_is_clamped_to_keyboard() {
        let (pitch, _) = find_nearest_note(10.0);
        assert_eq!(pitch.midi(), PIANO_LOWEST);
        let (pitch, freq) = find_nearest_note(445.0);
        assert_eq!(pitch, Pitch::A4);
        assert!(calculate_cents_deviation(445.0, freq) > 0.0);
        assert_eq!(piano_key(48).unwrap().pitch, Pitch::A4);
    }
}
