//! Timeline-relative transport.
//!
//! The transport stores cues at timeline positions (seconds from the start
//! of the loaded timeline) and, once started, hands back the cues that have
//! fallen due together with the audio-clock time they belong to.
//!
//! Cues are plain data. Whoever pulls them decides what they mean.

use super::clock::Clock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifier returned by [`Transport::schedule`] and [`Transport::schedule_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CueId(u64);

/// Payload of a scheduled transport event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cue {
    /// Trigger a note for `duration` seconds.
    Note {
        pitch: u8,
        duration: f64,
        velocity: f32,
    },
    /// Fade the output bus to silence.
    FadeOut,
    /// Release every sustained note of the instrument.
    ReleaseAll,
    /// The playback window is over.
    End,
}

/// A cue that has fallen due.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DueCue {
    pub id: CueId,
    /// Timeline position the cue was scheduled at.
    pub position: f64,
    /// Audio-clock time matching `position`.
    pub at: f64,
    pub cue: Cue,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledCue {
    position: f64,
    cue: Cue,
    once: bool,
    /// Persistent cues fire once per pass and are re-armed by `start`.
    armed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Motion {
    Stopped {
        position: f64,
    },
    Running {
        audio_origin: f64,
        position_origin: f64,
    },
}

/// Stores cues and converts between timeline positions and audio time.
pub struct Transport {
    clock: Arc<dyn Clock>,
    cues: BTreeMap<CueId, ScheduledCue>,
    next_id: u64,
    motion: Motion,
}

impl Transport {
    /// Creates a stopped transport at position 0.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cues: BTreeMap::new(),
            next_id: 1,
            motion: Motion::Stopped { position: 0.0 },
        }
    }

    /// Current audio-clock time.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Schedules a cue that fires every time the transport passes `position`.
    pub fn schedule(&mut self, position: f64, cue: Cue) -> CueId {
        self.insert(position, cue, false)
    }

    /// Schedules a cue that fires once and is then forgotten.
    pub fn schedule_once(&mut self, position: f64, cue: Cue) -> CueId {
        self.insert(position, cue, true)
    }

    fn insert(&mut self, position: f64, cue: Cue, once: bool) -> CueId {
        let id = CueId(self.next_id);
        self.next_id += 1;
        self.cues.insert(
            id,
            ScheduledCue {
                position,
                cue,
                once,
                armed: true,
            },
        );
        id
    }

    /// Removes a cue. Returns false if it was already gone.
    pub fn clear(&mut self, id: CueId) -> bool {
        self.cues.remove(&id).is_some()
    }

    /// Removes every cue scheduled at or after `from`.
    pub fn cancel(&mut self, from: f64) {
        self.cues.retain(|_, c| c.position < from);
    }

    /// Starts moving from `position`.
    ///
    /// Persistent cues at or after `position` are re-armed.
    pub fn start(&mut self, position: f64) {
        for cue in self.cues.values_mut() {
            if !cue.once {
                cue.armed = cue.position >= position;
            }
        }
        self.motion = Motion::Running {
            audio_origin: self.clock.now(),
            position_origin: position,
        };
    }

    /// Stops at audio time `at`, or now.
    pub fn stop(&mut self, at: Option<f64>) {
        let at = at.unwrap_or_else(|| self.clock.now());
        self.motion = Motion::Stopped {
            position: self.position_at(at),
        };
    }

    pub fn is_running(&self) -> bool {
        matches!(self.motion, Motion::Running { .. })
    }

    /// Current timeline position.
    pub fn position(&self) -> f64 {
        self.position_at(self.clock.now())
    }

    /// Timeline position at audio time `at`.
    pub fn position_at(&self, at: f64) -> f64 {
        match self.motion {
            Motion::Stopped { position } => position,
            Motion::Running {
                audio_origin,
                position_origin,
            } => position_origin + (at - audio_origin),
        }
    }

    /// Number of stored cues.
    pub fn pending(&self) -> usize {
        self.cues.len()
    }

    /// Takes every armed cue at or before `position + lookahead`, in time
    /// order. Nothing is due while stopped.
    pub fn take_due(&mut self, lookahead: f64) -> Vec<DueCue> {
        let Motion::Running {
            audio_origin,
            position_origin,
        } = self.motion
        else {
            return Vec::new();
        };
        let horizon = self.position() + lookahead.max(0.0);

        let mut due: Vec<DueCue> = self
            .cues
            .iter()
            .filter(|(_, c)| c.armed && c.position <= horizon)
            .map(|(&id, c)| DueCue {
                id,
                position: c.position,
                at: audio_origin + (c.position - position_origin),
                cue: c.cue,
            })
            .collect();
        due.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));

        for d in &due {
            let once = self.cues.get(&d.id).map(|c| c.once).unwrap_or(true);
            if once {
                self.cues.remove(&d.id);
            } else if let Some(c) = self.cues.get_mut(&d.id) {
                c.armed = false;
            }
        }
        due
    }
}
