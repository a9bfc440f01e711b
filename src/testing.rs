//! Test doubles shared by the unit tests: a recording backend over manual
//! clocks, and helpers that build MIDI byte streams with midly.

use crate::audio::{
    Backend, BackendLoader, Clock, GainStage, Instrument, InstrumentKind, ManualClock, OutputBus,
};
use crate::error::{PlayerError, Result};
use midly::num::{u15, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ---- MIDI fixtures ----

pub fn note_on(delta: u32, channel: u8, key: u8, vel: u8) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::new(delta),
        kind: TrackEventKind::Midi {
            channel: u4::new(channel),
            message: MidiMessage::NoteOn {
                key: u7::new(key),
                vel: u7::new(vel),
            },
        },
    }
}

pub fn note_off(delta: u32, channel: u8, key: u8) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::new(delta),
        kind: TrackEventKind::Midi {
            channel: u4::new(channel),
            message: MidiMessage::NoteOff {
                key: u7::new(key),
                vel: u7::new(0),
            },
        },
    }
}

pub fn meta(delta: u32, message: MetaMessage<'static>) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::new(delta),
        kind: TrackEventKind::Meta(message),
    }
}

/// Writes a 480 ticks-per-beat file. Tracks missing an end-of-track event
/// get one.
pub fn smf_bytes(format: Format, tracks: Vec<Vec<TrackEvent<'static>>>) -> Vec<u8> {
    smf_bytes_with_timing(format, Timing::Metrical(u15::new(480)), tracks)
}

pub fn smf_bytes_with_timing(
    format: Format,
    timing: Timing,
    tracks: Vec<Vec<TrackEvent<'static>>>,
) -> Vec<u8> {
    let mut smf = Smf::new(Header::new(format, timing));
    for mut track in tracks {
        let ended = matches!(
            track.last().map(|e| e.kind),
            Some(TrackEventKind::Meta(MetaMessage::EndOfTrack))
        );
        if !ended {
            track.push(meta(0, MetaMessage::EndOfTrack));
        }
        smf.tracks.push(track);
    }
    let mut bytes = Vec::new();
    smf.write_std(&mut bytes).expect("write to Vec cannot fail");
    bytes
}

// ---- Gain ----

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainOp {
    Set(f32),
    Ramp(f32, f64, f64),
    Cancel(f64),
}

/// Gain stage that records every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingGain {
    ops: Arc<Mutex<Vec<GainOp>>>,
}

impl RecordingGain {
    pub fn ops(&self) -> Vec<GainOp> {
        self.ops.lock().unwrap().clone()
    }
}

impl GainStage for RecordingGain {
    fn set_value_now(&mut self, value: f32) {
        self.ops.lock().unwrap().push(GainOp::Set(value));
    }

    fn ramp_to(&mut self, value: f32, ramp_seconds: f64, at: f64) {
        self.ops
            .lock()
            .unwrap()
            .push(GainOp::Ramp(value, ramp_seconds, at));
    }

    fn cancel_scheduled(&mut self, from: f64) {
        self.ops.lock().unwrap().push(GainOp::Cancel(from));
    }
}

// ---- Instrument ----

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
    pub pitch: u8,
    pub duration: f64,
    pub at: f64,
    pub velocity: f32,
}

#[derive(Debug, Default)]
struct LogState {
    triggers: Vec<Trigger>,
    releases: Vec<Option<f64>>,
    connects: usize,
    disconnects: usize,
}

/// What one recording instrument was asked to do.
#[derive(Debug, Clone, Default)]
pub struct InstrumentLog {
    state: Arc<Mutex<LogState>>,
}

impl InstrumentLog {
    pub fn triggers(&self) -> Vec<Trigger> {
        self.state.lock().unwrap().triggers.clone()
    }

    pub fn releases(&self) -> Vec<Option<f64>> {
        self.state.lock().unwrap().releases.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }
}

pub struct RecordingInstrument {
    kind: InstrumentKind,
    log: InstrumentLog,
    release_all: bool,
    fail_pitch: Option<u8>,
}

impl Instrument for RecordingInstrument {
    fn kind(&self) -> InstrumentKind {
        self.kind
    }

    fn trigger_timed(&mut self, pitch: u8, duration: f64, at: f64, velocity: f32) -> Result<()> {
        if self.fail_pitch == Some(pitch) {
            return Err(PlayerError::Trigger {
                pitch: crate::midi::note_to_name(pitch),
                message: "simulated failure".to_string(),
            });
        }
        self.log.state.lock().unwrap().triggers.push(Trigger {
            pitch,
            duration,
            at,
            velocity,
        });
        Ok(())
    }

    fn supports_release_all(&self) -> bool {
        self.release_all
    }

    fn release_all(&mut self, at: Option<f64>) {
        self.log.state.lock().unwrap().releases.push(at);
    }

    fn connect(&mut self, _bus: &OutputBus) {
        self.log.state.lock().unwrap().connects += 1;
    }

    fn disconnect(&mut self) {
        self.log.state.lock().unwrap().disconnects += 1;
    }
}

// ---- Backend ----

/// In-memory backend over two manual clocks.
#[derive(Clone)]
pub struct FakeBackend {
    pub clock: ManualClock,
    pub wall: ManualClock,
    pub gain: RecordingGain,
    logs: Arc<Mutex<Vec<InstrumentLog>>>,
    unavailable: Arc<AtomicBool>,
    release_all: Arc<AtomicBool>,
    fail_pitch: Arc<Mutex<Option<u8>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            clock: ManualClock::new(),
            wall: ManualClock::new(),
            gain: RecordingGain::default(),
            logs: Arc::new(Mutex::new(Vec::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
            release_all: Arc::new(AtomicBool::new(true)),
            fail_pitch: Arc::new(Mutex::new(None)),
        }
    }

    /// Advances the audio clock and the wall clock together.
    pub fn advance(&self, seconds: f64) {
        self.clock.advance(seconds);
        self.wall.advance(seconds);
    }

    pub fn created(&self) -> usize {
        self.logs.lock().unwrap().len()
    }

    pub fn instrument_log(&self, index: usize) -> InstrumentLog {
        self.logs.lock().unwrap()[index].clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Instruments created afterwards report no release-all support.
    pub fn without_release_all(self) -> Self {
        self.release_all.store(false, Ordering::SeqCst);
        self
    }

    /// Instruments created afterwards fail to trigger `pitch`.
    pub fn failing_pitch(self, pitch: u8) -> Self {
        *self.fail_pitch.lock().unwrap() = Some(pitch);
        self
    }
}

impl Backend for FakeBackend {
    fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    fn wall_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.wall.clone())
    }

    fn output_gain(&self) -> Box<dyn GainStage> {
        Box::new(self.gain.clone())
    }

    fn create_instrument(&self, kind: InstrumentKind) -> Result<Box<dyn Instrument>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PlayerError::BackendUnavailable(
                "fake backend offline".to_string(),
            ));
        }
        let log = InstrumentLog::default();
        self.logs.lock().unwrap().push(log.clone());
        Ok(Box::new(RecordingInstrument {
            kind,
            log,
            release_all: self.release_all.load(Ordering::SeqCst),
            fail_pitch: *self.fail_pitch.lock().unwrap(),
        }))
    }
}

/// Loader that hands out one [`FakeBackend`] and counts loads.
#[derive(Clone)]
pub struct FakeLoader {
    pub backend: FakeBackend,
    loads: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl FakeLoader {
    pub fn new(backend: FakeBackend) -> Self {
        Self {
            backend,
            loads: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl BackendLoader for FakeLoader {
    fn load(&self) -> Result<Arc<dyn Backend>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlayerError::BackendUnavailable(
                "no audio device".to_string(),
            ));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.backend.clone()))
    }
}
