//! Playback settings.
//!
//! Settings are stored as JSON. Every field has a default, so a partial
//! file (or an empty `{}`) is valid.

use crate::audio::InstrumentKind;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Timing constants used by the window scheduler.
///
/// The margins are small audio-glitch mitigations. They are kept
/// configurable because no single value suits every backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Subtracted from the window end before deciding whether a note is
    /// inside the window.
    pub end_epsilon: f64,

    /// Length of the gain fade that ends at the window boundary (seconds).
    pub fade_margin: f64,

    /// How long before the window end a release-all is issued (seconds).
    pub release_margin: f64,

    /// Extra wall-clock time the watchdog waits past the window length.
    pub watchdog_slack: f64,

    /// Ramp used to restore unity gain after a stop (seconds).
    pub restore_ramp: f64,

    /// Offset past a timed stop from which remaining cues are cancelled.
    pub cancel_slack: f64,

    /// How far ahead of the transport position cues are dispatched.
    /// Dispatched cues carry their exact audio time, so a non-zero value
    /// only trades latency for scheduling jitter.
    pub lookahead: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            end_epsilon: 1e-6,
            fade_margin: 0.003,
            release_margin: 0.0005,
            watchdog_slack: 0.25,
            restore_ramp: 0.005,
            cancel_slack: 0.05,
            lookahead: 0.1,
        }
    }
}

/// Top-level settings for a playback session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Instrument used for the first resolution.
    pub instrument: InstrumentKind,

    /// SoundFont used by the synthesis backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soundfont: Option<PathBuf>,

    /// Scheduler timing constants.
    pub playback: PlaybackConfig,
}

impl Settings {
    /// Parses settings from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes settings to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Loads settings from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
