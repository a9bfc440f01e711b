//! The loaded timeline.
//!
//! A timeline is everything the scheduler needs from one MIDI file: the
//! tracks, their total extent, and the first tempo and time signature.

use super::midi_import::parse_timeline;
use super::track::Track;
use super::{note_value_seconds, DEFAULT_TEMPO};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Time signature as read from the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    /// Beats per measure (numerator).
    pub beats_per_measure: u8,
    /// Beat unit (denominator). 4 means quarter note, 8 means eighth note.
    pub subdivision: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            beats_per_measure: 4,
            subdivision: 4,
        }
    }
}

impl TimeSignature {
    /// Length of one measure in quarter notes.
    pub fn quarters_per_measure(&self) -> f64 {
        self.beats_per_measure as f64 * 4.0 / self.subdivision.max(1) as f64
    }
}

/// An immutable set of tracks plus derived timing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    tracks: Vec<Track>,
    total_end_seconds: f64,
    tempo_bpm: f64,
    time_signature: TimeSignature,
}

impl Timeline {
    /// Builds a timeline from tracks and computes its total extent.
    pub fn new(tracks: Vec<Track>, tempo_bpm: f64, time_signature: TimeSignature) -> Self {
        let total_end_seconds = tracks.iter().map(|t| t.end_seconds()).fold(0.0, f64::max);
        Self {
            tracks,
            total_end_seconds,
            tempo_bpm,
            time_signature,
        }
    }

    /// Parses a Standard MIDI File byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlayerError::Parse`] if the bytes are not a
    /// supported MIDI file.
    pub fn from_midi(bytes: &[u8]) -> Result<Self> {
        parse_timeline(bytes)
    }

    /// Returns all tracks.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Returns `max(start + duration)` over every note, 0 when empty.
    pub fn total_end_seconds(&self) -> f64 {
        self.total_end_seconds
    }

    /// First tempo found in the file, or 120 BPM.
    pub fn tempo_bpm(&self) -> f64 {
        self.tempo_bpm
    }

    /// First time signature found in the file, or 4/4.
    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    /// Total number of notes across all tracks.
    pub fn note_count(&self) -> usize {
        self.tracks.iter().map(|t| t.note_count()).sum()
    }

    /// Converts a measure range (0-based, end exclusive) to seconds using
    /// the first tempo and time signature.
    ///
    /// # Returns
    ///
    /// `(start_seconds, end_seconds)`
    pub fn measure_range_seconds(&self, start_measure: u32, end_measure: u32) -> (f64, f64) {
        (
            self.measure_beat_seconds(start_measure, 0.0),
            self.measure_beat_seconds(end_measure, 0.0),
        )
    }

    /// Converts a position given as a measure (0-based) plus a beat offset
    /// into that measure to seconds.
    ///
    /// Beats are quarter notes at the first tempo. Fractional and negative
    /// offsets are allowed, so `(2, -1.0)` is the last quarter of measure 1.
    pub fn measure_beat_seconds(&self, measure: u32, beat: f64) -> f64 {
        let tempo = if self.tempo_bpm > 0.0 {
            self.tempo_bpm
        } else {
            DEFAULT_TEMPO
        };
        let quarters = measure as f64 * self.time_signature.quarters_per_measure() + beat;
        quarters * 60.0 / tempo
    }

    /// Converts a note value like "8n" to seconds at the timeline tempo.
    pub fn note_value_seconds(&self, value: &str) -> Option<f64> {
        note_value_seconds(value, self.tempo_bpm)
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_TEMPO, TimeSignature::default())
    }
}
