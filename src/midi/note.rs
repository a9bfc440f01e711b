//! Note event representation.
//!
//! A note event is a single pitched sound instruction with a start time,
//! a duration, a pitch and a velocity. Times are in seconds from the start
//! of the timeline.

use super::note_to_name;
use serde::{Deserialize, Serialize};

/// A single note of a loaded timeline.
///
/// Note events are created once while parsing and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// Start time in seconds (>= 0).
    pub start_seconds: f64,

    /// Duration in seconds (> 0).
    pub duration_seconds: f64,

    /// MIDI note number (0-127). 60 = Middle C (C4).
    pub pitch: u8,

    /// Normalized velocity in [0, 1].
    pub velocity: f32,
}

impl NoteEvent {
    /// Creates a new note event, clamping values into their valid ranges.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeplay::midi::NoteEvent;
    ///
    /// // Middle C, half a second long, starting at one second
    /// let note = NoteEvent::new(1.0, 0.5, 60, 0.8);
    /// assert_eq!(note.end_seconds(), 1.5);
    /// ```
    pub fn new(start_seconds: f64, duration_seconds: f64, pitch: u8, velocity: f32) -> Self {
        Self {
            start_seconds: start_seconds.max(0.0),
            duration_seconds: duration_seconds.max(0.0),
            pitch: pitch.min(127),
            velocity: velocity.clamp(0.0, 1.0),
        }
    }

    /// Returns the end time of this note (start + duration).
    pub fn end_seconds(&self) -> f64 {
        self.start_seconds + self.duration_seconds
    }

    /// Returns the note name, e.g. "C4".
    pub fn name(&self) -> String {
        note_to_name(self.pitch)
    }

    /// Checks if this note overlaps with `[start, end)`.
    pub fn overlaps_range(&self, start: f64, end: f64) -> bool {
        self.start_seconds < end && self.end_seconds() > start
    }

    /// Clips the note to `[start, end)`.
    ///
    /// # Returns
    ///
    /// `(trigger_time, duration)` of the part that falls inside the range,
    /// or None when nothing of positive length remains.
    pub fn clip_to(&self, start: f64, end: f64) -> Option<(f64, f64)> {
        if !self.overlaps_range(start, end) {
            return None;
        }
        let when = self.start_seconds.max(start);
        let until = self.end_seconds().min(end);
        let duration = until - when;
        if duration > 0.0 {
            Some((when, duration))
        } else {
            None
        }
    }
}
