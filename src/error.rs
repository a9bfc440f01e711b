//! Error types for loading, resolving and playing timelines.

use thiserror::Error;

/// Errors surfaced by the timeline model, the scheduler and the manager.
#[derive(Error, Debug)]
pub enum PlayerError {
    /// The MIDI byte stream could not be parsed.
    #[error("MIDI parse error: {0}")]
    Parse(String),

    /// The sound backend is missing or failed to initialize.
    #[error("Sound backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Playback was requested before a timeline and instrument were set up.
    #[error("Transport not ready: {0}")]
    TransportNotReady(&'static str),

    /// Window bounds are not finite numbers.
    #[error("Invalid playback window [{start}, {end})")]
    InvalidWindow { start: f64, end: f64 },

    /// `play` was called before any MIDI data was loaded.
    #[error("MIDI not loaded")]
    MidiNotLoaded,

    /// An instrument name did not match any known kind.
    #[error("Unknown instrument type: {0}")]
    UnknownInstrument(String),

    /// A single note trigger failed. Logged by the scheduler, never fatal.
    #[error("Trigger failed for {pitch}: {message}")]
    Trigger { pitch: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
