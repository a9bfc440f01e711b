//! Instrument resolution.
//!
//! Instruments are created lazily by the backend, connected to the output
//! bus exactly once, and never destroyed during a session: switching kind
//! only disconnects the previous instrument. Cues that were already handed
//! a handle keep a valid instrument to talk to.

use super::bus::OutputBus;
use super::Backend;
use crate::error::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The kinds of sound source a session can play through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// A simple synthesized voice.
    #[default]
    ToneGenerator,
    /// A sampled instrument (piano).
    SampleBased,
}

impl FromStr for InstrumentKind {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synth" | "tone" | "tone_generator" | "tonegenerator" => {
                Ok(InstrumentKind::ToneGenerator)
            }
            "sampler" | "sample" | "sample_based" | "samplebased" => {
                Ok(InstrumentKind::SampleBased)
            }
            _ => Err(PlayerError::UnknownInstrument(s.to_string())),
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::ToneGenerator => write!(f, "synth"),
            InstrumentKind::SampleBased => write!(f, "sampler"),
        }
    }
}

/// A sound-producing capability.
///
/// Times are audio-clock seconds. `at` values in the past mean "now".
pub trait Instrument: Send {
    fn kind(&self) -> InstrumentKind;

    /// Plays `pitch` for `duration` seconds starting at `at`.
    fn trigger_timed(&mut self, pitch: u8, duration: f64, at: f64, velocity: f32) -> Result<()>;

    /// Whether [`Instrument::release_all`] does anything.
    fn supports_release_all(&self) -> bool {
        false
    }

    /// Releases every sounding note at `at`, or immediately.
    fn release_all(&mut self, _at: Option<f64>) {}

    /// Routes the instrument through `bus`.
    fn connect(&mut self, bus: &OutputBus);

    /// Removes the instrument from its bus. The instrument stays usable.
    fn disconnect(&mut self);
}

/// Shared reference to a resolved instrument.
///
/// Carries its own connection guard so repeated resolution never connects
/// the same instrument twice.
#[derive(Clone)]
pub struct InstrumentHandle {
    inner: Arc<Mutex<Box<dyn Instrument>>>,
    connected: Arc<AtomicBool>,
    kind: InstrumentKind,
    supports_release_all: bool,
}

impl InstrumentHandle {
    pub fn new(instrument: Box<dyn Instrument>) -> Self {
        let kind = instrument.kind();
        let supports_release_all = instrument.supports_release_all();
        Self {
            inner: Arc::new(Mutex::new(instrument)),
            connected: Arc::new(AtomicBool::new(false)),
            kind,
            supports_release_all,
        }
    }

    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    pub fn supports_release_all(&self) -> bool {
        self.supports_release_all
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connects to `bus` unless already connected.
    ///
    /// # Returns
    ///
    /// true if this call made the connection.
    pub fn ensure_connected(&self, bus: &OutputBus) -> bool {
        if self.connected.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Ok(mut instrument) = self.inner.lock() {
            instrument.disconnect();
            instrument.connect(bus);
        }
        true
    }

    /// Disconnects from the bus, keeping the instrument alive.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Ok(mut instrument) = self.inner.lock() {
                instrument.disconnect();
            }
        }
    }

    pub fn trigger_timed(&self, pitch: u8, duration: f64, at: f64, velocity: f32) -> Result<()> {
        let mut instrument = self.inner.lock().map_err(|_| PlayerError::Trigger {
            pitch: crate::midi::note_to_name(pitch),
            message: "instrument lock poisoned".to_string(),
        })?;
        instrument.trigger_timed(pitch, duration, at, velocity)
    }

    /// Releases all notes if the instrument supports it.
    pub fn release_all(&self, at: Option<f64>) {
        if !self.supports_release_all {
            return;
        }
        if let Ok(mut instrument) = self.inner.lock() {
            instrument.release_all(at);
        }
    }

    /// Returns true if both handles point at the same instrument.
    pub fn ptr_eq(&self, other: &InstrumentHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("kind", &self.kind)
            .field("connected", &self.is_connected())
            .field("supports_release_all", &self.supports_release_all)
            .finish()
    }
}

/// Creates, memoizes and routes instruments for one session.
pub struct InstrumentResolver {
    backend: Arc<dyn Backend>,
    bus: OutputBus,
    /// Every instrument created this session, by kind.
    handles: HashMap<InstrumentKind, InstrumentHandle>,
    current: Option<InstrumentKind>,
}

impl InstrumentResolver {
    pub fn new(backend: Arc<dyn Backend>, bus: OutputBus) -> Self {
        Self {
            backend,
            bus,
            handles: HashMap::new(),
            current: None,
        }
    }

    /// Returns the instrument for `kind`, creating it on first use.
    ///
    /// Resolving the current kind again returns the identical handle.
    /// Switching kind disconnects every other instrument, including ones
    /// connected by [`acquire`](Self::acquire), and connects the new one.
    ///
    /// # Errors
    ///
    /// [`PlayerError::BackendUnavailable`] if the backend cannot create the
    /// instrument. The current instrument is left as it was.
    pub fn resolve(&mut self, kind: InstrumentKind) -> Result<InstrumentHandle> {
        let handle = self.get_or_create(kind)?;

        for (other, old) in self.handles.iter().filter(|&(&k, _)| k != kind) {
            if old.is_connected() {
                old.disconnect();
                tracing::debug!("Disconnected {} instrument", other);
            }
        }
        handle.ensure_connected(&self.bus);
        self.current = Some(kind);
        Ok(handle)
    }

    /// Returns a connected instrument for `kind` without changing the current one.
    ///
    /// Used by one-shot triggers, which must not disconnect an instrument a
    /// playing window is routed to. Both instruments stay connected until the
    /// next [`resolve`](Self::resolve) switches kind.
    ///
    /// # Errors
    ///
    /// [`PlayerError::BackendUnavailable`] if the backend cannot create the
    /// instrument.
    pub fn acquire(&mut self, kind: InstrumentKind) -> Result<InstrumentHandle> {
        let handle = self.get_or_create(kind)?;
        handle.ensure_connected(&self.bus);
        Ok(handle)
    }

    fn get_or_create(&mut self, kind: InstrumentKind) -> Result<InstrumentHandle> {
        if let Some(handle) = self.handles.get(&kind) {
            return Ok(handle.clone());
        }
        let instrument = self.backend.create_instrument(kind).map_err(|e| match e {
            PlayerError::BackendUnavailable(_) => e,
            other => PlayerError::BackendUnavailable(other.to_string()),
        })?;
        tracing::info!("Created {} instrument", kind);
        let handle = InstrumentHandle::new(instrument);
        self.handles.insert(kind, handle.clone());
        Ok(handle)
    }

    /// Releases the notes of every connected instrument.
    pub fn release_all(&self, at: Option<f64>) {
        for handle in self.handles.values().filter(|h| h.is_connected()) {
            handle.release_all(at);
        }
    }

    /// The instrument resolved last, if any.
    pub fn current(&self) -> Option<InstrumentHandle> {
        self.current.and_then(|k| self.handles.get(&k).cloned())
    }

    pub fn bus(&self) -> &OutputBus {
        &self.bus
    }
}
