//! Audio engine for real-time MIDI synthesis.
//!
//! rustysynth renders the notes and rodio plays the result. Everything the
//! scheduler asks for is stamped with the audio frame it belongs to and
//! applied by the renderer when it reaches that frame, so timing does not
//! depend on when the control thread gets around to calling in.

use super::bus::{GainStage, OutputBus};
use super::clock::{Clock, FrameClock, SystemClock};
use super::instrument::{Instrument, InstrumentKind};
use super::{Backend, BackendLoader};
use crate::error::{PlayerError, Result};
use anyhow::Context;
use rodio::{OutputStream, OutputStreamHandle, Source};
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sample rate for audio synthesis (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44100;

/// Audio buffer size for low-latency playback.
/// Smaller = lower latency but higher CPU usage.
const BUFFER_SIZE: usize = 256;

/// Channel volume (CC7) of a connected instrument.
const CONNECTED_VOLUME: u8 = 100;

/// Loads a SoundFont and builds a synthesizer for it.
pub fn load_synthesizer<P: AsRef<Path>>(soundfont_path: P) -> anyhow::Result<Synthesizer> {
    let mut file = BufReader::new(File::open(soundfont_path.as_ref()).with_context(|| {
        format!(
            "Failed to open SoundFont: {}",
            soundfont_path.as_ref().display()
        )
    })?);
    let soundfont = Arc::new(
        SoundFont::new(&mut file)
            .map_err(|e| anyhow::anyhow!("Failed to load SoundFont: {:?}", e))?,
    );
    let settings = SynthesizerSettings::new(SAMPLE_RATE as i32);
    Synthesizer::new(&soundfont, &settings)
        .map_err(|e| anyhow::anyhow!("Failed to create synthesizer: {:?}", e))
}

/// A synthesizer command waiting for its frame.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SynthEvent {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8 },
    AllOff { channel: u8, immediate: bool },
    Control { channel: u8, command: u8, data1: u8, data2: u8 },
}

impl SynthEvent {
    fn program_change(channel: u8, program: u8) -> Self {
        // Program change is MIDI command 0xC0 (192)
        SynthEvent::Control {
            channel,
            command: 0xC0,
            data1: program,
            data2: 0,
        }
    }

    fn volume(channel: u8, volume: u8) -> Self {
        // Control change 7 is volume
        SynthEvent::Control {
            channel,
            command: 0xB0,
            data1: 7,
            data2: volume,
        }
    }

    fn apply(self, synth: &mut Synthesizer) {
        match self {
            SynthEvent::NoteOn {
                channel,
                key,
                velocity,
            } => synth.note_on(channel as i32, key as i32, velocity as i32),
            SynthEvent::NoteOff { channel, key } => synth.note_off(channel as i32, key as i32),
            SynthEvent::AllOff { channel, immediate } => {
                synth.note_off_all_channel(channel as i32, immediate)
            }
            SynthEvent::Control {
                channel,
                command,
                data1,
                data2,
            } => synth.process_midi_message(
                channel as i32,
                command as i32,
                data1 as i32,
                data2 as i32,
            ),
        }
    }
}

/// Frame-ordered queue of synthesizer events.
#[derive(Debug, Default)]
struct EventQueue {
    events: VecDeque<(u64, SynthEvent)>,
}

impl EventQueue {
    /// Inserts after any event already queued for the same frame.
    fn push(&mut self, frame: u64, event: SynthEvent) {
        let index = self.events.partition_point(|(f, _)| *f <= frame);
        self.events.insert(index, (frame, event));
    }

    fn pop_due(&mut self, frame: u64) -> Option<SynthEvent> {
        match self.events.front() {
            Some((f, _)) if *f <= frame => self.events.pop_front().map(|(_, e)| e),
            _ => None,
        }
    }

    fn next_frame(&self) -> Option<u64> {
        self.events.front().map(|(f, _)| *f)
    }

    /// Drops note-ons and note-offs for `channel` at or after `from`.
    fn discard_notes(&mut self, channel: u8, from: u64) {
        self.events.retain(|(frame, event)| {
            let on_channel = matches!(
                event,
                SynthEvent::NoteOn { channel: c, .. } | SynthEvent::NoteOff { channel: c, .. }
                    if *c == channel
            );
            !(on_channel && *frame >= from)
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.events.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    start: f64,
    duration: f64,
    target: f32,
}

impl Ramp {
    fn value(&self, from: f32, t: f64) -> f32 {
        if self.duration <= 0.0 || t >= self.start + self.duration {
            return self.target;
        }
        let progress = ((t - self.start) / self.duration).clamp(0.0, 1.0) as f32;
        from + (self.target - from) * progress
    }

    fn end(&self) -> f64 {
        self.start + self.duration.max(0.0)
    }
}

/// Piecewise-linear gain automation in audio seconds.
///
/// A ramp starts from whatever value the earlier ramps reached at its start
/// time.
#[derive(Debug, Clone)]
pub struct GainEnvelope {
    base: f32,
    ramps: Vec<Ramp>,
}

impl Default for GainEnvelope {
    fn default() -> Self {
        Self {
            base: 1.0,
            ramps: Vec::new(),
        }
    }
}

impl GainEnvelope {
    pub fn value_at(&self, t: f64) -> f32 {
        let mut active: Option<(&Ramp, f32)> = None;
        for ramp in &self.ramps {
            if ramp.start > t {
                break;
            }
            let from = match active {
                Some((previous, previous_from)) => previous.value(previous_from, ramp.start),
                None => self.base,
            };
            active = Some((ramp, from));
        }
        match active {
            Some((ramp, from)) => ramp.value(from, t),
            None => self.base,
        }
    }

    pub fn set_value(&mut self, value: f32) {
        self.ramps.clear();
        self.base = value;
    }

    pub fn ramp_to(&mut self, value: f32, ramp_seconds: f64, at: f64) {
        let index = self.ramps.partition_point(|r| r.start <= at);
        self.ramps.insert(
            index,
            Ramp {
                start: at,
                duration: ramp_seconds,
                target: value,
            },
        );
    }

    pub fn cancel_from(&mut self, from: f64) {
        self.ramps.retain(|r| r.start < from);
    }

    /// Folds ramps that are over by `t` into the base value.
    fn settle(&mut self, t: f64) {
        if !self.ramps.is_empty() && self.ramps.iter().all(|r| r.end() <= t) {
            self.base = self.value_at(t);
            self.ramps.clear();
        }
    }
}

struct MixerState {
    synth: Synthesizer,
    queue: EventQueue,
    gain: GainEnvelope,
}

/// The synthesizer together with its pending events and output gain.
///
/// Cloning shares the same state. The frame counter is the audio clock.
#[derive(Clone)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl Mixer {
    pub fn new(synth: Synthesizer) -> Self {
        let sample_rate = synth.get_sample_rate() as u32;
        Self {
            state: Arc::new(Mutex::new(MixerState {
                synth,
                queue: EventQueue::default(),
                gain: GainEnvelope::default(),
            })),
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// The audio clock: seconds of audio rendered so far.
    pub fn clock(&self) -> FrameClock {
        FrameClock::new(Arc::clone(&self.frames), self.sample_rate)
    }

    fn frame_at(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MixerState) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    fn queue(&self, at: f64, event: SynthEvent) -> bool {
        let frame = self.frame_at(at);
        self.with_state(|state| state.queue.push(frame, event))
            .is_some()
    }

    /// Renders the next `left.len()` frames, applying due events and gain.
    pub fn render(&self, left: &mut [f32], right: &mut [f32]) {
        let n = left.len().min(right.len());
        let Ok(mut guard) = self.state.lock() else {
            left.fill(0.0);
            right.fill(0.0);
            return;
        };
        let MixerState { synth, queue, gain } = &mut *guard;
        let start = self.frames.load(Ordering::Acquire);

        let mut offset = 0;
        while offset < n {
            let frame = start + offset as u64;
            while let Some(event) = queue.pop_due(frame) {
                event.apply(synth);
            }
            let end = queue
                .next_frame()
                .map(|f| ((f - start) as usize).min(n))
                .unwrap_or(n);
            synth.render(&mut left[offset..end], &mut right[offset..end]);
            offset = end;
        }

        let rate = self.sample_rate as f64;
        for i in 0..n {
            let g = gain.value_at((start + i as u64) as f64 / rate);
            left[i] *= g;
            right[i] *= g;
        }
        let end_frame = start + n as u64;
        gain.settle(end_frame as f64 / rate);
        self.frames.store(end_frame, Ordering::Release);
    }
}

/// Audio source that pulls samples from the mixer.
/// Implements rodio's Source trait for playback.
struct MixerSource {
    mixer: Mixer,
    left_buf: Vec<f32>,
    right_buf: Vec<f32>,
    buf_pos: usize,
    /// Current channel (0 = left, 1 = right).
    channel: usize,
}

impl MixerSource {
    fn new(mixer: Mixer) -> Self {
        Self {
            mixer,
            left_buf: vec![0.0; BUFFER_SIZE],
            right_buf: vec![0.0; BUFFER_SIZE],
            buf_pos: BUFFER_SIZE, // Start at end to trigger first render
            channel: 0,
        }
    }
}

impl Iterator for MixerSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buf_pos >= BUFFER_SIZE {
            self.mixer.render(&mut self.left_buf, &mut self.right_buf);
            self.buf_pos = 0;
        }

        // Interleave stereo samples: L, R, L, R, ...
        let sample = if self.channel == 0 {
            self.left_buf[self.buf_pos]
        } else {
            self.right_buf[self.buf_pos]
        };

        self.channel = 1 - self.channel;
        if self.channel == 0 {
            self.buf_pos += 1;
        }

        Some(sample)
    }
}

impl Source for MixerSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None // Infinite stream
    }
}

/// The mixer's output gain as seen by the bus.
pub struct EngineGain {
    mixer: Mixer,
}

impl EngineGain {
    pub fn new(mixer: Mixer) -> Self {
        Self { mixer }
    }
}

impl GainStage for EngineGain {
    fn set_value_now(&mut self, value: f32) {
        self.mixer.with_state(|state| state.gain.set_value(value));
    }

    fn ramp_to(&mut self, value: f32, ramp_seconds: f64, at: f64) {
        self.mixer
            .with_state(|state| state.gain.ramp_to(value, ramp_seconds, at));
    }

    fn cancel_scheduled(&mut self, from: f64) {
        self.mixer.with_state(|state| state.gain.cancel_from(from));
    }
}

/// One synthesizer channel playing a General MIDI program.
pub struct SynthInstrument {
    mixer: Mixer,
    kind: InstrumentKind,
    channel: u8,
    program: u8,
}

impl SynthInstrument {
    pub fn new(mixer: Mixer, kind: InstrumentKind) -> Self {
        // Lead 1 (square) for the tone generator, Acoustic Grand Piano for samples
        let (channel, program) = match kind {
            InstrumentKind::ToneGenerator => (0, 80),
            InstrumentKind::SampleBased => (1, 0),
        };
        Self {
            mixer,
            kind,
            channel,
            program,
        }
    }

    fn now(&self) -> f64 {
        self.mixer.clock().now()
    }
}

impl Instrument for SynthInstrument {
    fn kind(&self) -> InstrumentKind {
        self.kind
    }

    fn trigger_timed(&mut self, pitch: u8, duration: f64, at: f64, velocity: f32) -> Result<()> {
        let velocity = (velocity * 127.0).round().clamp(1.0, 127.0) as u8;
        let key = pitch.min(127);
        let queued = self.mixer.queue(
            at,
            SynthEvent::NoteOn {
                channel: self.channel,
                key,
                velocity,
            },
        ) && self.mixer.queue(
            at + duration.max(0.0),
            SynthEvent::NoteOff {
                channel: self.channel,
                key,
            },
        );
        if queued {
            Ok(())
        } else {
            Err(PlayerError::Trigger {
                pitch: crate::midi::note_to_name(pitch),
                message: "synthesizer lock poisoned".to_string(),
            })
        }
    }

    fn supports_release_all(&self) -> bool {
        true
    }

    /// A timed release cuts voices at `at`, where the bus has already faded
    /// out. An immediate release lets voices ring out naturally.
    fn release_all(&mut self, at: Option<f64>) {
        let (at, immediate) = match at {
            Some(at) => (at, true),
            None => (self.now(), false),
        };
        let frame = self.mixer.frame_at(at);
        let channel = self.channel;
        self.mixer.with_state(|state| {
            // The AllOff below ends every voice a dropped note-off was for
            state.queue.discard_notes(channel, frame);
            state
                .queue
                .push(frame, SynthEvent::AllOff { channel, immediate });
        });
    }

    fn connect(&mut self, _bus: &OutputBus) {
        let now = self.now();
        self.mixer
            .queue(now, SynthEvent::program_change(self.channel, self.program));
        self.mixer
            .queue(now, SynthEvent::volume(self.channel, CONNECTED_VOLUME));
    }

    fn disconnect(&mut self) {
        let now = self.now();
        let frame = self.mixer.frame_at(now);
        let channel = self.channel;
        self.mixer.with_state(|state| {
            state.queue.discard_notes(channel, 0);
            state.queue.push(frame, SynthEvent::volume(channel, 0));
            state.queue.push(
                frame,
                SynthEvent::AllOff {
                    channel,
                    immediate: true,
                },
            );
        });
        tracing::trace!("Synth channel {} disconnected", channel);
    }
}

/// Real-time backend: one synthesizer played through the default output.
pub struct AudioEngine {
    mixer: Mixer,
    wall: SystemClock,
    /// Audio output stream (must be kept alive).
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
}

impl AudioEngine {
    /// Creates a new audio engine with the specified SoundFont.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The SoundFont file cannot be read
    /// - The SoundFont is invalid
    /// - Audio output cannot be initialized
    pub fn new<P: AsRef<Path>>(soundfont_path: P) -> anyhow::Result<Self> {
        let synth = load_synthesizer(soundfont_path)?;
        let mixer = Mixer::new(synth);

        let (stream, stream_handle) =
            OutputStream::try_default().context("Failed to open audio output")?;
        stream_handle
            .play_raw(MixerSource::new(mixer.clone()))
            .context("Failed to start audio playback")?;

        tracing::info!("Audio output started at {} Hz", mixer.sample_rate());
        Ok(Self {
            mixer,
            wall: SystemClock::new(),
            _stream: stream,
            _stream_handle: stream_handle,
        })
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }
}

impl Backend for AudioEngine {
    fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.mixer.clock())
    }

    fn wall_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.wall)
    }

    fn output_gain(&self) -> Box<dyn GainStage> {
        Box::new(EngineGain::new(self.mixer.clone()))
    }

    fn create_instrument(&self, kind: InstrumentKind) -> Result<Box<dyn Instrument>> {
        Ok(Box::new(SynthInstrument::new(self.mixer.clone(), kind)))
    }
}

/// Opens an [`AudioEngine`] for a SoundFont on first use.
#[derive(Debug, Clone)]
pub struct SoundFontLoader {
    path: PathBuf,
}

impl SoundFontLoader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl BackendLoader for SoundFontLoader {
    fn load(&self) -> Result<Arc<dyn Backend>> {
        let engine = AudioEngine::new(&self.path)
            .map_err(|e| PlayerError::BackendUnavailable(format!("{:#}", e)))?;
        Ok(Arc::new(engine))
    }
}
