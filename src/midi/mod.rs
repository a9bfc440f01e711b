//! Timeline model built from Standard MIDI Files.
//!
//! A loaded file becomes an immutable [`Timeline`]: tracks of note events
//! measured in seconds, plus the first tempo and time signature found.

mod midi_import;
mod note;
mod timeline;
mod track;

pub use midi_import::parse_timeline;
pub use note::NoteEvent;
pub use timeline::{TimeSignature, Timeline};
pub use track::Track;

/// Standard MIDI note names for display purposes.
/// Maps MIDI note number (0-127) to note name within an octave.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Flat spellings accepted when parsing note names.
const FLAT_NAMES: [&str; 12] = [
    "C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B",
];

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Converts a MIDI note number to a human-readable note name with octave.
///
/// # Arguments
///
/// * `note` - MIDI note number (0-127)
///
/// # Returns
///
/// String representation like "C4" or "F#5"
///
/// # Examples
///
/// ```
/// use rangeplay::midi::note_to_name;
///
/// let name = note_to_name(60); // Middle C
/// assert_eq!(name, "C4");
/// ```
pub fn note_to_name(note: u8) -> String {
    let octave = (note / 12) as i8 - 1; // MIDI octave convention
    let note_index = (note % 12) as usize;
    format!("{}{}", NOTE_NAMES[note_index], octave)
}

/// Converts a note name to MIDI note number.
///
/// Accepts sharps ("F#5") and flats ("Bb3").
///
/// # Returns
///
/// MIDI note number (0-127) or None if invalid
pub fn name_to_note(name: &str) -> Option<u8> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    // Byte offset where the octave number starts
    let octave_start = name.find(|c: char| c.is_ascii_digit() || c == '-')?;

    let note_part = &name[..octave_start];
    let octave_part = &name[octave_start..];

    let note_index = NOTE_NAMES
        .iter()
        .position(|&n| n == note_part)
        .or_else(|| FLAT_NAMES.iter().position(|&n| n == note_part))?;
    let octave: i8 = octave_part.parse().ok()?;

    // MIDI note = (octave + 1) * 12 + note_index
    let midi_note = (octave as i16 + 1) * 12 + note_index as i16;
    if (0..=127).contains(&midi_note) {
        Some(midi_note as u8)
    } else {
        None
    }
}

/// Converts a note value such as "4n", "8n", "8n." or "8t" to seconds.
///
/// "Nn" is a 1/N note, a trailing "." makes it dotted and "Nt" is a triplet.
/// Quarter notes last one beat at `bpm`.
///
/// Returns None for anything else.
pub fn note_value_seconds(value: &str, bpm: f64) -> Option<f64> {
    if bpm <= 0.0 || !bpm.is_finite() {
        return None;
    }
    let value = value.trim();
    let (body, dotted) = match value.strip_suffix('.') {
        Some(body) => (body, true),
        None => (value, false),
    };
    let (digits, triplet) = if let Some(d) = body.strip_suffix('n') {
        (d, false)
    } else if let Some(d) = body.strip_suffix('t') {
        (d, true)
    } else {
        return None;
    };
    let division: u32 = digits.parse().ok()?;
    if division == 0 {
        return None;
    }

    let quarter = 60.0 / bpm;
    let mut seconds = quarter * 4.0 / division as f64;
    if triplet {
        seconds *= 2.0 / 3.0;
    }
    if dotted {
        seconds *= 1.5;
    }
    Some(seconds)
}
