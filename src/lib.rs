//! rangeplay - Windowed MIDI playback.
//!
//! This library parses Standard MIDI Files into a timeline of notes and plays
//! any `[start, end)` window of it exactly once, cancellably, through a
//! SoundFont synthesizer.

pub mod audio;
pub mod config;
pub mod error;
pub mod manager;
pub mod midi;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use audio::{
    AudioEngine, Completion, CompletionStatus, InstrumentKind, PlaybackOutcome, Player,
    SoundFontLoader, TransportState,
};
pub use config::{PlaybackConfig, Settings};
pub use error::{PlayerError, Result};
pub use manager::{ChordOptions, Manager, OneShot, PlayRequest, SetupOptions};
pub use midi::{NoteEvent, TimeSignature, Timeline, Track};
