//! Session façade.
//!
//! A [`Manager`] owns everything a playback session needs: the backend, the
//! output bus, the instrument resolver and the window scheduler. Callers
//! drive it with a handful of operations (setup, load, play, stop) and pump
//! it regularly while something is playing.

use crate::audio::{
    Backend, BackendLoader, Completion, InstrumentKind, InstrumentResolver, OutputBus,
    PlaybackHook, Player,
};
use crate::config::{PlaybackConfig, Settings};
use crate::error::{PlayerError, Result};
use crate::midi::{name_to_note, note_value_seconds, TimeSignature, Timeline, DEFAULT_TEMPO};
use std::sync::Arc;
use std::time::Duration;

/// Arpeggio step used when the note value cannot be parsed.
const FALLBACK_ARP_STEP: f64 = 0.125;

/// What part of the loaded timeline to play.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayRequest {
    /// The whole timeline.
    All,
    /// `[start, end)` in seconds.
    Window { start: f64, end: f64 },
    /// `[start, end)` in measures, counted from 0.
    Measures { start: u32, end: u32 },
    /// `[start, end)` as (measure, quarter-note beat offset) pairs.
    MeasureBeats { start: (u32, f64), end: (u32, f64) },
}

/// Options for [`Manager::setup`].
pub struct SetupOptions {
    pub instrument: InstrumentKind,
    pub on_play_start: Option<PlaybackHook>,
    pub on_play_end: Option<PlaybackHook>,
    pub playback: PlaybackConfig,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            instrument: InstrumentKind::default(),
            on_play_start: None,
            on_play_end: None,
            playback: PlaybackConfig::default(),
        }
    }
}

impl From<&Settings> for SetupOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            instrument: settings.instrument,
            playback: settings.playback,
            ..Default::default()
        }
    }
}

/// A chord or arpeggio played outside any window.
#[derive(Debug, Clone, PartialEq)]
pub struct ChordOptions {
    /// Note names such as "C4" or "Eb3".
    pub notes: Vec<String>,
    /// Length of each note in seconds.
    pub duration: f64,
    /// Play the notes one after another instead of together.
    pub arpeggiate: bool,
    /// Arpeggio step as a note value ("8n", "16n", ...).
    pub arp_rate: String,
    pub velocity: f32,
}

impl Default for ChordOptions {
    fn default() -> Self {
        Self {
            notes: vec!["C4".to_string(), "E4".to_string(), "G4".to_string()],
            duration: 1.0,
            arpeggiate: false,
            arp_rate: "8n".to_string(),
            velocity: 0.8,
        }
    }
}

/// A fire-and-forget sound. Knows how long it rings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OneShot {
    duration: f64,
}

impl OneShot {
    fn empty() -> Self {
        Self { duration: 0.0 }
    }

    /// Seconds from the trigger until the last note ends.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Blocks until the sound is over.
    pub fn wait(&self) {
        if self.duration > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(self.duration));
        }
    }
}

/// A named one-note cue.
struct Bell {
    note: &'static str,
    duration: f64,
    velocity: f32,
}

fn bell_preset(bell_id: &str) -> Bell {
    match bell_id {
        "endBell1" => Bell {
            note: "C6",
            duration: 0.2,
            velocity: 0.9,
        },
        "endBell2" => Bell {
            note: "G5",
            duration: 0.25,
            velocity: 0.9,
        },
        other => {
            tracing::warn!("Unknown bell {:?}, using endBell1", other);
            bell_preset("endBell1")
        }
    }
}

struct Session {
    backend: Arc<dyn Backend>,
    resolver: InstrumentResolver,
    player: Player,
}

/// Entry point for loading and playing MIDI.
pub struct Manager {
    loader: Box<dyn BackendLoader>,
    session: Option<Session>,
    /// Kind used the next time an instrument is resolved.
    instrument: InstrumentKind,
    timeline: Option<Arc<Timeline>>,
}

impl Manager {
    pub fn new(loader: Box<dyn BackendLoader>) -> Self {
        Self {
            loader,
            session: None,
            instrument: InstrumentKind::default(),
            timeline: None,
        }
    }

    /// Loads the backend on first call and registers callbacks.
    ///
    /// Calling again only replaces the callbacks and the instrument kind.
    /// The backend and the timing constants of the first call are kept.
    ///
    /// # Errors
    ///
    /// [`PlayerError::BackendUnavailable`] if the backend fails to load.
    pub fn setup(&mut self, options: SetupOptions) -> Result<()> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let backend = self.loader.load()?;
                let bus = OutputBus::new(backend.output_gain());
                let resolver = InstrumentResolver::new(Arc::clone(&backend), bus.clone());
                let player = Player::new(
                    backend.clock(),
                    backend.wall_clock(),
                    bus,
                    options.playback,
                );
                tracing::info!("Audio backend ready");
                Session {
                    backend,
                    resolver,
                    player,
                }
            }
        };
        let session = self.session.insert(session);
        session.player.set_on_play_start(options.on_play_start);
        session.player.set_on_play_end(options.on_play_end);
        self.instrument = options.instrument;
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or(PlayerError::TransportNotReady("manager is not set up"))
    }

    /// Parses `bytes` and prepares the player. Nothing is played.
    ///
    /// # Errors
    ///
    /// - [`PlayerError::Parse`] for malformed MIDI; the previous timeline
    ///   stays loaded
    /// - [`PlayerError::TransportNotReady`] before [`Manager::setup`]
    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        let timeline = Arc::new(Timeline::from_midi(bytes)?);
        let kind = self.instrument;
        let session = self.session_mut()?;
        session.player.stop(None);
        let instrument = session.resolver.resolve(kind)?;
        session.player.setup(Arc::clone(&timeline), instrument);
        self.timeline = Some(timeline);
        Ok(())
    }

    /// Starts playback of the loaded timeline.
    ///
    /// A window already playing is replaced.
    pub fn play(&mut self, request: PlayRequest) -> Result<Completion> {
        let timeline = self.timeline.clone().ok_or(PlayerError::MidiNotLoaded)?;
        let kind = self.instrument;
        let session = self.session_mut()?;

        let ready = session
            .player
            .instrument()
            .is_some_and(|i| i.kind() == kind && i.is_connected());
        if !ready {
            let instrument = session.resolver.resolve(kind)?;
            session.player.setup(Arc::clone(&timeline), instrument);
        }

        match request {
            PlayRequest::All => session.player.play_all(),
            PlayRequest::Window { start, end } => session.player.play_window(start, end),
            PlayRequest::Measures { start, end } => {
                let (start, end) = timeline.measure_range_seconds(start, end);
                session.player.play_window(start, end)
            }
            PlayRequest::MeasureBeats { start, end } => session.player.play_window(
                timeline.measure_beat_seconds(start.0, start.1),
                timeline.measure_beat_seconds(end.0, end.1),
            ),
        }
    }

    /// Stops playback and silences one-shot sounds.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.player.stop(None);
            session.resolver.release_all(None);
        }
    }

    /// Selects the instrument for the next playback. A window in flight
    /// keeps its instrument.
    pub fn set_instrument(&mut self, kind: InstrumentKind) {
        self.instrument = kind;
    }

    /// Like [`Manager::set_instrument`], by name ("synth", "sampler", ...).
    pub fn set_instrument_by_name(&mut self, name: &str) -> Result<()> {
        self.instrument = name.parse()?;
        Ok(())
    }

    pub fn instrument_kind(&self) -> InstrumentKind {
        self.instrument
    }

    /// Plays a chord, or an arpeggio, right away.
    ///
    /// Returns an empty [`OneShot`] if the manager is not set up. Unknown
    /// note names are skipped.
    pub fn play_chord(&mut self, options: ChordOptions) -> Result<OneShot> {
        let tempo = self
            .timeline
            .as_ref()
            .map(|t| t.tempo_bpm())
            .unwrap_or(DEFAULT_TEMPO);
        let kind = self.instrument;
        let Some(session) = self.session.as_mut() else {
            return Ok(OneShot::empty());
        };

        // A window in flight keeps its instrument connected
        let instrument = session.resolver.acquire(kind)?;
        let step = if options.arpeggiate {
            note_value_seconds(&options.arp_rate, tempo).unwrap_or_else(|| {
                tracing::warn!("Invalid arpeggio rate {:?}", options.arp_rate);
                FALLBACK_ARP_STEP
            })
        } else {
            0.0
        };

        let now = session.backend.clock().now();
        let mut offset = None;
        let mut next = 0.0;
        for name in &options.notes {
            let Some(pitch) = name_to_note(name) else {
                tracing::warn!("Skipping unknown note {:?}", name);
                continue;
            };
            if let Err(e) =
                instrument.trigger_timed(pitch, options.duration, now + next, options.velocity)
            {
                tracing::error!("Chord note failed: {}", e);
            }
            offset = Some(next);
            next += step;
        }

        Ok(match offset {
            Some(last) => OneShot {
                duration: last + options.duration,
            },
            None => OneShot::empty(),
        })
    }

    /// Plays one of the bell presets ("endBell1", "endBell2").
    pub fn play_bell(&mut self, bell_id: &str) -> Result<OneShot> {
        let bell = bell_preset(bell_id);
        self.play_chord(ChordOptions {
            notes: vec![bell.note.to_string()],
            duration: bell.duration,
            arpeggiate: false,
            velocity: bell.velocity,
            ..Default::default()
        })
    }

    /// Runs one scheduling step. See [`Player::pump`].
    pub fn pump(&mut self) -> usize {
        self.session
            .as_mut()
            .map(|s| s.player.pump())
            .unwrap_or(0)
    }

    /// True once nothing of the last window is left to render.
    /// See [`Player::is_drained`].
    pub fn is_drained(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.player.is_drained())
            .unwrap_or(true)
    }

    pub fn is_playing(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.player.is_playing())
            .unwrap_or(false)
    }

    pub fn timeline(&self) -> Option<&Arc<Timeline>> {
        self.timeline.as_ref()
    }

    pub fn time_signature(&self) -> Option<TimeSignature> {
        self.timeline.as_ref().map(|t| t.time_signature())
    }
}
