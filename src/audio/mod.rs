//! Audio side of the player.
//!
//! This module provides:
//! - A timeline-relative transport and the window scheduler built on it
//! - Instrument resolution and the shared output bus
//! - A rustysynth/rodio backend for real-time playback
//! - Offline WAV rendering of a playback window

pub mod bus;
pub mod clock;
pub mod engine;
pub mod export;
pub mod instrument;
pub mod player;
pub mod transport;

use crate::error::Result;
use std::sync::Arc;

pub use bus::{GainStage, OutputBus};
pub use clock::{Clock, FrameClock, ManualClock, SystemClock};
pub use engine::{AudioEngine, SoundFontLoader};
pub use export::render_window_to_wav;
pub use instrument::{Instrument, InstrumentHandle, InstrumentKind, InstrumentResolver};
pub use player::{
    Completion, CompletionStatus, PlaybackHook, PlaybackOutcome, Player, TransportState,
};
pub use transport::{Cue, CueId, Transport};

/// An initialized audio backend.
///
/// Owns the audio clock, the physical output and the means to create
/// instruments for it. A backend stays on the thread that opened it.
pub trait Backend {
    /// The clock instruments and gain ramps are scheduled against.
    fn clock(&self) -> Arc<dyn Clock>;

    /// Real time, independent of audio rendering.
    fn wall_clock(&self) -> Arc<dyn Clock>;

    /// A fresh gain stage wired to the physical output.
    fn output_gain(&self) -> Box<dyn GainStage>;

    fn create_instrument(&self, kind: InstrumentKind) -> Result<Box<dyn Instrument>>;
}

/// Initializes a [`Backend`] on demand.
pub trait BackendLoader {
    fn load(&self) -> Result<Arc<dyn Backend>>;
}
