//! Window scheduler and transport state machine.
//!
//! The player takes a timeline and a `[start, end)` window and drives an
//! instrument through it:
//!
//! - notes are clipped to the window and scheduled as transport cues
//! - a short fade on the output bus and a release-all are scheduled just
//!   before the window end, followed by a terminal cue
//! - a wall-clock watchdog forces the end if the terminal cue never fires
//!
//! Starting a window always fully cancels the previous one before anything
//! new is scheduled. Only cues whose IDs are still in the player's handle
//! set are ever dispatched, so a superseded window cannot sound.
//!
//! The player is single-threaded: the owner calls [`Player::pump`]
//! regularly and every operation takes `&mut self`.

use super::bus::OutputBus;
use super::clock::Clock;
use super::instrument::InstrumentHandle;
use super::transport::{Cue, CueId, DueCue, Transport};
use crate::config::PlaybackConfig;
use crate::error::{PlayerError, Result};
use crate::midi::Timeline;
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

/// Callback invoked when playback starts or ends.
pub type PlaybackHook = Box<dyn FnMut() + Send>;

/// Transport state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Playing,
    Stopping,
}

/// How a playback window completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The terminal cue fired at the window end.
    Finished,
    /// The watchdog forced the end.
    TimedOut,
    /// `stop` was called before the window ended.
    Stopped,
    /// The window was empty or inverted. Nothing was scheduled.
    Empty,
}

/// Observed state of a [`Completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Pending,
    Done(PlaybackOutcome),
    /// A newer window replaced this one before it completed.
    Superseded,
}

impl CompletionStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, CompletionStatus::Pending)
    }
}

/// Resolves once a playback window completes.
#[derive(Debug)]
pub struct Completion {
    rx: Receiver<PlaybackOutcome>,
    status: CompletionStatus,
}

impl Completion {
    fn new(rx: Receiver<PlaybackOutcome>) -> Self {
        Self {
            rx,
            status: CompletionStatus::Pending,
        }
    }

    fn resolved(outcome: PlaybackOutcome) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(outcome);
        Self::new(rx)
    }

    /// Checks for completion without blocking.
    pub fn poll(&mut self) -> CompletionStatus {
        if self.status.is_pending() {
            self.status = match self.rx.try_recv() {
                Ok(outcome) => CompletionStatus::Done(outcome),
                Err(TryRecvError::Empty) => CompletionStatus::Pending,
                Err(TryRecvError::Disconnected) => CompletionStatus::Superseded,
            };
        }
        self.status
    }
}

/// The window scheduler.
pub struct Player {
    transport: Transport,
    /// Wall clock for the watchdog.
    wall: Arc<dyn Clock>,
    bus: OutputBus,
    config: PlaybackConfig,
    timeline: Option<Arc<Timeline>>,
    instrument: Option<InstrumentHandle>,
    state: TransportState,
    /// Every cue scheduled for the current window.
    scheduled: HashSet<CueId>,
    /// Wall-clock deadline of the current window.
    watchdog: Option<f64>,
    /// Audio time until which the last window can still be heard.
    audible_until: f64,
    /// Taken exactly once per window when it finishes.
    finish: Option<Sender<PlaybackOutcome>>,
    on_play_start: PlaybackHook,
    on_play_end: PlaybackHook,
}

impl Player {
    /// Creates an idle player.
    ///
    /// # Arguments
    ///
    /// * `clock` - Audio clock the backend renders against
    /// * `wall` - Wall clock for the watchdog
    /// * `bus` - The session's output bus
    /// * `config` - Timing constants
    pub fn new(
        clock: Arc<dyn Clock>,
        wall: Arc<dyn Clock>,
        bus: OutputBus,
        config: PlaybackConfig,
    ) -> Self {
        Self {
            transport: Transport::new(clock),
            wall,
            bus,
            config,
            timeline: None,
            instrument: None,
            state: TransportState::Idle,
            scheduled: HashSet::new(),
            watchdog: None,
            audible_until: 0.0,
            finish: None,
            on_play_start: Box::new(|| {}),
            on_play_end: Box::new(|| {}),
        }
    }

    /// Installs a timeline and the instrument to play it with.
    ///
    /// Any window in flight is stopped first. The instrument is connected to
    /// the output bus unless it already is.
    pub fn setup(&mut self, timeline: Arc<Timeline>, instrument: InstrumentHandle) {
        if self.state == TransportState::Playing {
            self.stop(None);
        }
        instrument.ensure_connected(&self.bus);
        tracing::info!(
            "Timeline ready: {} notes, {:.3}s total, {} instrument",
            timeline.note_count(),
            timeline.total_end_seconds(),
            instrument.kind()
        );
        self.timeline = Some(timeline);
        self.instrument = Some(instrument);
    }

    pub fn set_on_play_start(&mut self, hook: Option<PlaybackHook>) {
        self.on_play_start = hook.unwrap_or_else(|| Box::new(|| {}));
    }

    pub fn set_on_play_end(&mut self, hook: Option<PlaybackHook>) {
        self.on_play_end = hook.unwrap_or_else(|| Box::new(|| {}));
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }

    pub fn timeline(&self) -> Option<&Arc<Timeline>> {
        self.timeline.as_ref()
    }

    pub fn instrument(&self) -> Option<&InstrumentHandle> {
        self.instrument.as_ref()
    }

    /// Number of cues held for the current window.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    fn ready(&self) -> Result<(Arc<Timeline>, InstrumentHandle)> {
        let timeline = self
            .timeline
            .clone()
            .ok_or(PlayerError::TransportNotReady("no timeline loaded"))?;
        let instrument = self
            .instrument
            .clone()
            .ok_or(PlayerError::TransportNotReady("instrument is not ready"))?;
        Ok((timeline, instrument))
    }

    /// Plays the whole timeline.
    pub fn play_all(&mut self) -> Result<Completion> {
        let (timeline, _) = self.ready()?;
        self.play_window(0.0, timeline.total_end_seconds())
    }

    /// Plays `[start_seconds, end_seconds)` of the timeline.
    ///
    /// An empty or inverted window stops any current playback and returns a
    /// completion that is already [`PlaybackOutcome::Empty`].
    ///
    /// # Errors
    ///
    /// - [`PlayerError::TransportNotReady`] before [`Player::setup`]
    /// - [`PlayerError::InvalidWindow`] for non-finite bounds
    pub fn play_window(&mut self, start_seconds: f64, end_seconds: f64) -> Result<Completion> {
        let (timeline, instrument) = self.ready()?;
        if !start_seconds.is_finite() || !end_seconds.is_finite() {
            return Err(PlayerError::InvalidWindow {
                start: start_seconds,
                end: end_seconds,
            });
        }
        if end_seconds <= start_seconds {
            tracing::warn!(
                "Window end {:.3}s <= start {:.3}s. Nothing to play.",
                end_seconds,
                start_seconds
            );
            self.stop(None);
            return Ok(Completion::resolved(PlaybackOutcome::Empty));
        }

        self.hard_reset();

        self.state = TransportState::Playing;
        let (tx, rx) = mpsc::channel();
        self.finish = Some(tx);
        (self.on_play_start)();

        self.bus.reset();

        let window_end = end_seconds - self.config.end_epsilon;
        for track in timeline.tracks() {
            for note in track.notes() {
                let Some((when, duration)) = note.clip_to(start_seconds, window_end) else {
                    continue;
                };
                let id = self.transport.schedule(
                    when,
                    Cue::Note {
                        pitch: note.pitch,
                        duration,
                        velocity: note.velocity,
                    },
                );
                self.scheduled.insert(id);
            }
        }
        let note_cues = self.scheduled.len();

        let fade = self.config.fade_margin;
        if end_seconds > start_seconds + fade {
            let id = self.transport.schedule_once(end_seconds - fade, Cue::FadeOut);
            self.scheduled.insert(id);
        }

        let release = self.config.release_margin;
        if instrument.supports_release_all() && end_seconds > start_seconds + release {
            let id = self
                .transport
                .schedule_once(end_seconds - release, Cue::ReleaseAll);
            self.scheduled.insert(id);
        }

        let id = self.transport.schedule_once(end_seconds, Cue::End);
        self.scheduled.insert(id);

        self.transport.start(start_seconds);

        let duration = end_seconds - start_seconds;
        self.watchdog = Some(self.wall.now() + duration + self.config.watchdog_slack);
        self.audible_until = self.transport.now() + duration + self.config.restore_ramp;

        tracing::debug!(
            "Playing [{:.3}, {:.3}): {} note cues",
            start_seconds,
            end_seconds,
            note_cues
        );
        Ok(Completion::new(rx))
    }

    /// True once the audio clock has passed the end of the last window and
    /// the output gain is restored.
    ///
    /// The end cue fires up to `lookahead` ahead of the audio, so a finished
    /// window may still be rendering.
    pub fn is_drained(&self) -> bool {
        self.state == TransportState::Idle && self.transport.now() >= self.audible_until
    }

    /// Stops playback, immediately or at audio time `at`.
    ///
    /// Safe to call repeatedly and while idle.
    pub fn stop(&mut self, at: Option<f64>) {
        if self.state == TransportState::Stopping {
            return;
        }
        let was_playing = self.state == TransportState::Playing;
        self.state = TransportState::Stopping;
        self.watchdog = None;

        if was_playing {
            self.clear_all_scheduled();

            if let Some(instrument) = &self.instrument {
                instrument.release_all(at);
            }

            let now = self.transport.now();
            match at.filter(|t| t.is_finite()) {
                Some(at) => {
                    let position = self.transport.position_at(at);
                    self.transport.stop(Some(at));
                    self.transport.cancel(position + self.config.cancel_slack);
                }
                None => {
                    self.transport.stop(None);
                    self.transport.cancel(0.0);
                }
            }

            (self.on_play_end)();

            let restore_at = at.filter(|t| t.is_finite()).unwrap_or(now);
            self.bus.restore(restore_at, self.config.restore_ramp);
            self.audible_until = restore_at + self.config.restore_ramp;

            if let Some(tx) = self.finish.take() {
                let _ = tx.send(PlaybackOutcome::Stopped);
            }
        }

        self.state = TransportState::Idle;
    }

    /// Runs one scheduling step: dispatches due cues, then checks the
    /// watchdog.
    ///
    /// # Returns
    ///
    /// The number of cues dispatched.
    pub fn pump(&mut self) -> usize {
        let mut dispatched = 0;
        for due in self.transport.take_due(self.config.lookahead) {
            if !self.scheduled.contains(&due.id) {
                continue;
            }
            self.dispatch(due);
            dispatched += 1;
        }
        self.check_watchdog();
        dispatched
    }

    fn dispatch(&mut self, due: DueCue) {
        match due.cue {
            Cue::Note {
                pitch,
                duration,
                velocity,
            } => {
                if let Some(instrument) = &self.instrument {
                    if let Err(e) = instrument.trigger_timed(pitch, duration, due.at, velocity) {
                        tracing::error!("Note trigger failed: {}", e);
                    }
                }
            }
            Cue::FadeOut => self.bus.fade_out_at(due.at, self.config.fade_margin),
            Cue::ReleaseAll => {
                if let Some(instrument) = &self.instrument {
                    instrument.release_all(Some(due.at));
                }
            }
            Cue::End => self.finish_window(PlaybackOutcome::Finished, Some(due.at)),
        }
    }

    fn check_watchdog(&mut self) {
        let Some(deadline) = self.watchdog else {
            return;
        };
        if self.wall.now() < deadline {
            return;
        }
        self.watchdog = None;
        if self.state != TransportState::Playing || self.finish.is_none() {
            return;
        }
        tracing::warn!("Watchdog fired. Forcing stop.");
        self.finish_window(PlaybackOutcome::TimedOut, None);
    }

    /// Stops and resolves the window's completion, once per window.
    fn finish_window(&mut self, outcome: PlaybackOutcome, at: Option<f64>) {
        let Some(tx) = self.finish.take() else {
            return;
        };
        self.stop(at);
        let _ = tx.send(outcome);
    }

    fn clear_all_scheduled(&mut self) {
        for id in self.scheduled.drain() {
            self.transport.clear(id);
        }
    }

    /// Cancels everything belonging to the previous window.
    fn hard_reset(&mut self) {
        // Cut whatever the previous window already handed to the instrument
        if self.state == TransportState::Playing {
            if let Some(instrument) = &self.instrument {
                instrument.release_all(Some(self.transport.now()));
            }
        }
        self.transport.stop(None);
        self.transport.cancel(0.0);
        self.clear_all_scheduled();
        self.watchdog = None;
        // Dropping the sender marks the previous completion as superseded
        self.finish = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{Backend, InstrumentKind, InstrumentResolver};
    use crate::midi::{NoteEvent, TimeSignature, Track};
    use crate::testing::{FakeBackend, GainOp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> PlaybackConfig {
        PlaybackConfig {
            lookahead: 0.0,
            ..Default::default()
        }
    }

    fn timeline(notes: &[(f64, f64, u8)]) -> Arc<Timeline> {
        let mut track = Track::new("Piano", 0);
        for &(start, duration, pitch) in notes {
            track.add_note(NoteEvent::new(start, duration, pitch, 0.8));
        }
        Arc::new(Timeline::new(vec![track], 120.0, TimeSignature::default()))
    }

    fn player_for(backend: &FakeBackend, notes: &[(f64, f64, u8)]) -> Player {
        let bus = OutputBus::new(backend.output_gain());
        let mut resolver = InstrumentResolver::new(Arc::new(backend.clone()), bus.clone());
        let instrument = resolver.resolve(InstrumentKind::ToneGenerator).unwrap();
        let mut player = Player::new(backend.clock(), backend.wall_clock(), bus, test_config());
        player.setup(timeline(notes), instrument);
        player
    }

    /// Pumps in small steps until the clocks reach `seconds` more.
    fn run_for(backend: &FakeBackend, player: &mut Player, seconds: f64) {
        let steps = (seconds / 0.01).round() as usize;
        for _ in 0..steps {
            player.pump();
            backend.advance(0.01);
        }
        player.pump();
    }

    fn counter() -> (Arc<AtomicUsize>, PlaybackHook) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        let hook: PlaybackHook = Box::new(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, hook)
    }

    #[test]
    fn test_not_ready_before_setup() {
        let backend = FakeBackend::new();
        let bus = OutputBus::new(backend.output_gain());
        let mut player = Player::new(backend.clock(), backend.wall_clock(), bus, test_config());
        assert!(matches!(
            player.play_window(0.0, 1.0),
            Err(PlayerError::TransportNotReady(_))
        ));
        assert!(matches!(
            player.play_all(),
            Err(PlayerError::TransportNotReady(_))
        ));
    }

    #[test]
    fn test_clipping_partial_note() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(1.0, 2.0, 60)]);
        let _done = player.play_window(2.0, 5.0).unwrap();
        player.pump();

        let triggers = backend.instrument_log(0).triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].pitch, 60);
        assert_eq!(triggers[0].at, 0.0); // window start maps to audio time 0
        assert!((triggers[0].duration - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_clipping_at_window_end() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.5, 2.0, 60), (1.0, 0.5, 62)]);
        let _done = player.play_window(0.0, 1.0).unwrap();
        run_for(&backend, &mut player, 1.1);

        let triggers = backend.instrument_log(0).triggers();
        // The note starting exactly at the window end is excluded
        assert_eq!(triggers.len(), 1);
        assert!((triggers[0].duration - 0.5).abs() < 1e-5);
        assert!(triggers[0].duration < 0.5);
    }

    #[test]
    fn test_play_all_matches_full_window() {
        let notes = [(0.0, 1.0, 60), (2.0, 1.5, 62), (6.0, 1.5, 64)];

        let backend_all = FakeBackend::new();
        let mut all = player_for(&backend_all, &notes);
        assert_eq!(all.timeline().unwrap().total_end_seconds(), 7.5);
        let mut done_all = all.play_all().unwrap();
        run_for(&backend_all, &mut all, 8.0);

        let backend_window = FakeBackend::new();
        let mut window = player_for(&backend_window, &notes);
        let mut done_window = window.play_window(0.0, 7.5).unwrap();
        run_for(&backend_window, &mut window, 8.0);

        assert_eq!(
            backend_all.instrument_log(0).triggers(),
            backend_window.instrument_log(0).triggers()
        );
        assert_eq!(backend_all.gain.ops(), backend_window.gain.ops());
        assert_eq!(done_all.poll(), CompletionStatus::Done(PlaybackOutcome::Finished));
        assert_eq!(
            done_window.poll(),
            CompletionStatus::Done(PlaybackOutcome::Finished)
        );
    }

    #[test]
    fn test_invalid_windows_complete_immediately() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 10.0, 60)]);

        for (start, end) in [(5.0, 5.0), (5.0, 3.0)] {
            let mut done = player.play_window(start, end).unwrap();
            assert_eq!(done.poll(), CompletionStatus::Done(PlaybackOutcome::Empty));
            assert_eq!(player.scheduled_count(), 0);
            assert_eq!(player.state(), TransportState::Idle);
        }
        run_for(&backend, &mut player, 1.0);
        assert!(backend.instrument_log(0).triggers().is_empty());
        assert!(backend.gain.ops().is_empty());
    }

    #[test]
    fn test_non_finite_window_is_error() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 1.0, 60)]);
        assert!(matches!(
            player.play_window(0.0, f64::NAN),
            Err(PlayerError::InvalidWindow { .. })
        ));
        assert!(matches!(
            player.play_window(f64::NEG_INFINITY, 1.0),
            Err(PlayerError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn test_new_window_supersedes_previous() {
        let notes: Vec<(f64, f64, u8)> = (0..10).map(|i| (i as f64, 1.0, 60 + i as u8)).collect();
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &notes);

        let mut first = player.play_window(0.0, 10.0).unwrap();
        let mut second = player.play_window(2.0, 4.0).unwrap();
        assert_eq!(player.scheduled_count(), 2 + 3); // two notes, fade, release, end

        run_for(&backend, &mut player, 10.5);

        let pitches: Vec<u8> = backend
            .instrument_log(0)
            .triggers()
            .iter()
            .map(|t| t.pitch)
            .collect();
        assert_eq!(pitches, vec![62, 63]);
        assert_eq!(first.poll(), CompletionStatus::Superseded);
        assert_eq!(second.poll(), CompletionStatus::Done(PlaybackOutcome::Finished));
    }

    #[test]
    fn test_supersede_cuts_sounding_notes() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 8.0, 60), (2.0, 1.0, 62)]);

        let _first = player.play_window(0.0, 10.0).unwrap();
        run_for(&backend, &mut player, 1.0);
        assert!(backend.instrument_log(0).releases().is_empty());

        let _second = player.play_window(2.0, 4.0).unwrap();
        let releases = backend.instrument_log(0).releases();
        assert_eq!(releases.len(), 1);
        assert!((releases[0].unwrap() - 1.0).abs() < 1e-9);

        // From idle there is nothing to cut
        player.stop(None);
        let releases = backend.instrument_log(0).releases().len();
        let _third = player.play_window(2.0, 4.0).unwrap();
        assert_eq!(backend.instrument_log(0).releases().len(), releases);
    }

    #[test]
    fn test_drained_after_window_is_rendered() {
        let backend = FakeBackend::new();
        let bus = OutputBus::new(backend.output_gain());
        let mut resolver = InstrumentResolver::new(Arc::new(backend.clone()), bus.clone());
        let instrument = resolver.resolve(InstrumentKind::ToneGenerator).unwrap();
        let mut player = Player::new(
            backend.clock(),
            backend.wall_clock(),
            bus,
            PlaybackConfig::default(),
        );
        player.setup(timeline(&[(0.0, 1.0, 60)]), instrument);
        assert!(player.is_drained());

        let mut done = player.play_window(0.0, 1.0).unwrap();
        assert!(!player.is_drained());

        // The end cue is inside the lookahead before the audio reaches it
        backend.advance(0.95);
        player.pump();
        assert_eq!(done.poll(), CompletionStatus::Done(PlaybackOutcome::Finished));
        assert!(!player.is_drained());

        backend.clock.set(1.0);
        assert!(!player.is_drained());
        backend.clock.set(1.006);
        assert!(player.is_drained());
    }

    #[test]
    fn test_end_sequence() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 2.0, 60)]);
        let mut done = player.play_window(0.0, 1.0).unwrap();
        run_for(&backend, &mut player, 1.2);

        assert_eq!(done.poll(), CompletionStatus::Done(PlaybackOutcome::Finished));
        assert_eq!(player.state(), TransportState::Idle);
        assert_eq!(player.scheduled_count(), 0);

        let releases = backend.instrument_log(0).releases();
        assert_eq!(releases.len(), 2);
        assert!((releases[0].unwrap() - 0.9995).abs() < 1e-9);
        assert!((releases[1].unwrap() - 1.0).abs() < 1e-9);

        let ops = backend.gain.ops();
        assert_eq!(ops[0], GainOp::Cancel(f64::NEG_INFINITY));
        assert_eq!(ops[1], GainOp::Set(1.0));
        match ops[2] {
            GainOp::Ramp(value, ramp, at) => {
                assert_eq!(value, 0.0);
                assert_eq!(ramp, 0.003);
                assert!((at - 0.997).abs() < 1e-9);
            }
            other => panic!("expected fade, got {:?}", other),
        }
        assert!(matches!(ops[3], GainOp::Cancel(at) if (at - 1.0).abs() < 1e-9));
        assert!(matches!(ops[4], GainOp::Ramp(v, r, _) if v == 1.0 && r == 0.005));
    }

    #[test]
    fn test_short_window_skips_fade() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 1.0, 60)]);
        let _done = player.play_window(0.0, 0.002).unwrap();
        // note, release, end
        assert_eq!(player.scheduled_count(), 3);
        run_for(&backend, &mut player, 0.1);
        assert!(!backend
            .gain
            .ops()
            .iter()
            .any(|op| matches!(op, GainOp::Ramp(v, _, _) if *v == 0.0)));
    }

    #[test]
    fn test_no_release_all_without_support() {
        let backend = FakeBackend::new().without_release_all();
        let mut player = player_for(&backend, &[(0.0, 1.0, 60)]);
        let _done = player.play_window(0.0, 1.0).unwrap();
        assert_eq!(player.scheduled_count(), 3); // note, fade, end
        run_for(&backend, &mut player, 1.2);
        assert!(backend.instrument_log(0).releases().is_empty());
        assert!(!player.is_playing());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 1.0, 60), (2.0, 1.0, 62)]);
        let (ends, hook) = counter();
        player.set_on_play_end(Some(hook));

        let mut done = player.play_all().unwrap();
        player.pump();
        player.stop(None);
        let pending_after_one = (player.state(), player.scheduled_count());
        player.stop(None);

        assert_eq!(pending_after_one, (TransportState::Idle, 0));
        assert_eq!(player.state(), TransportState::Idle);
        assert_eq!(player.scheduled_count(), 0);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(done.poll(), CompletionStatus::Done(PlaybackOutcome::Stopped));

        // Nothing left to fire
        run_for(&backend, &mut player, 3.5);
        assert_eq!(backend.instrument_log(0).triggers().len(), 1);
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 1.0, 60)]);
        let (ends, hook) = counter();
        player.set_on_play_end(Some(hook));
        player.stop(None);
        assert_eq!(ends.load(Ordering::SeqCst), 0);
        assert!(backend.gain.ops().is_empty());
    }

    #[test]
    fn test_watchdog_fires_once() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 1.0, 60)]);
        let (ends, hook) = counter();
        player.set_on_play_end(Some(hook));

        let mut done = player.play_window(0.0, 2.0).unwrap();

        // The audio clock stalls: only wall-clock time passes
        backend.wall.advance(2.2);
        player.pump();
        assert!(player.is_playing());
        assert_eq!(done.poll(), CompletionStatus::Pending);

        backend.wall.advance(0.1);
        player.pump();
        assert_eq!(player.state(), TransportState::Idle);
        assert_eq!(done.poll(), CompletionStatus::Done(PlaybackOutcome::TimedOut));
        assert_eq!(ends.load(Ordering::SeqCst), 1);

        // A stray re-armed deadline finds the window already done
        player.watchdog = Some(0.0);
        player.pump();
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert!(player.watchdog.is_none());
    }

    #[test]
    fn test_terminal_cue_disarms_watchdog() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 1.0, 60)]);
        let (ends, hook) = counter();
        player.set_on_play_end(Some(hook));
        let mut done = player.play_window(0.0, 1.0).unwrap();
        run_for(&backend, &mut player, 3.0);
        assert_eq!(done.poll(), CompletionStatus::Done(PlaybackOutcome::Finished));
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_failure_does_not_abort_window() {
        let backend = FakeBackend::new().failing_pitch(62);
        let mut player = player_for(&backend, &[(0.0, 0.5, 60), (0.5, 0.5, 62), (1.0, 0.5, 64)]);
        let mut done = player.play_all().unwrap();
        run_for(&backend, &mut player, 2.0);

        let pitches: Vec<u8> = backend
            .instrument_log(0)
            .triggers()
            .iter()
            .map(|t| t.pitch)
            .collect();
        assert_eq!(pitches, vec![60, 64]);
        assert_eq!(done.poll(), CompletionStatus::Done(PlaybackOutcome::Finished));
    }

    #[test]
    fn test_start_callback_per_window() {
        let backend = FakeBackend::new();
        let mut player = player_for(&backend, &[(0.0, 4.0, 60)]);
        let (starts, hook) = counter();
        player.set_on_play_start(Some(hook));

        let _a = player.play_window(0.0, 1.0).unwrap();
        let _b = player.play_window(1.0, 2.0).unwrap();
        assert!(player.is_playing());
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lookahead_keeps_exact_audio_time() {
        let backend = FakeBackend::new();
        let bus = OutputBus::new(backend.output_gain());
        let mut resolver = InstrumentResolver::new(Arc::new(backend.clone()), bus.clone());
        let instrument = resolver.resolve(InstrumentKind::ToneGenerator).unwrap();
        let mut player = Player::new(
            backend.clock(),
            backend.wall_clock(),
            bus,
            PlaybackConfig::default(),
        );
        player.setup(timeline(&[(0.05, 0.5, 60)]), instrument);

        backend.advance(3.0);
        let _done = player.play_all().unwrap();
        assert_eq!(player.pump(), 1);

        let triggers = backend.instrument_log(0).triggers();
        assert!((triggers[0].at - 3.05).abs() < 1e-9);
    }
}
