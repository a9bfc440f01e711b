//! Track representation.
//!
//! A track holds the note events that came from one MIDI channel of one
//! file track, sorted by start time.

use super::note::NoteEvent;
use serde::{Deserialize, Serialize};

/// A named group of note events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Human-readable name for the track.
    pub name: String,

    /// MIDI channel (0-15) the notes were read from.
    pub channel: u8,

    /// Notes in this track, sorted by start time.
    notes: Vec<NoteEvent>,
}

impl Track {
    /// Creates an empty track.
    pub fn new(name: impl Into<String>, channel: u8) -> Self {
        Self {
            name: name.into(),
            channel: channel.min(15),
            notes: Vec::new(),
        }
    }

    /// Adds a note, keeping the notes sorted by start time.
    ///
    /// Notes with the same start time keep their insertion order.
    pub fn add_note(&mut self, note: NoteEvent) {
        let pos = self
            .notes
            .partition_point(|n| n.start_seconds <= note.start_seconds);
        self.notes.insert(pos, note);
    }

    /// Returns all notes in the track (sorted by start time).
    pub fn notes(&self) -> &[NoteEvent] {
        &self.notes
    }

    /// Returns the number of notes in the track.
    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    /// Returns the end of the last sounding note, or 0 for an empty track.
    pub fn end_seconds(&self) -> f64 {
        self.notes
            .iter()
            .map(|n| n.end_seconds())
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_notes_sorted() {
        let mut track = Track::new("Test", 0);
        track.add_note(NoteEvent::new(0.5, 0.25, 60, 0.8));
        track.add_note(NoteEvent::new(0.0, 0.25, 62, 0.8));
        track.add_note(NoteEvent::new(1.0, 0.25, 64, 0.8));
        track.add_note(NoteEvent::new(0.5, 0.25, 67, 0.8));

        let pitches: Vec<u8> = track.notes().iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, vec![62, 60, 67, 64]);
    }

    #[test]
    fn test_end_seconds() {
        let mut track = Track::new("Test", 0);
        assert_eq!(track.end_seconds(), 0.0);

        track.add_note(NoteEvent::new(0.0, 3.0, 60, 0.8));
        track.add_note(NoteEvent::new(1.0, 0.5, 62, 0.8));
        assert_eq!(track.end_seconds(), 3.0);
        assert_eq!(track.note_count(), 2);
    }

    #[test]
    fn test_channel_clamped() {
        assert_eq!(Track::new("Drums", 20).channel, 15);
    }
}
