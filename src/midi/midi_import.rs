//! Standard MIDI File (SMF) import.
//!
//! Parses a .mid byte stream into a [`Timeline`] with note times in seconds.
//! Supports SMF Format 0 (single track) and Format 1 (multi-track) files.
//!
//! # Limitations
//!
//! - Only note on/off events become notes
//! - Tempo changes from every track form one tempo map
//! - Controllers, program changes, pitch bend and SysEx are ignored

use super::note::NoteEvent;
use super::timeline::{TimeSignature, Timeline};
use super::track::Track;
use super::DEFAULT_TEMPO;
use crate::error::{PlayerError, Result};
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::{HashMap, VecDeque};

/// Microseconds per quarter note at 120 BPM.
const DEFAULT_USEC_PER_BEAT: f64 = 500_000.0;

/// Open notes during parsing.
/// Key is (channel, pitch), value is a queue of (start_tick, velocity).
type ActiveNotes = HashMap<(u8, u8), VecDeque<(u64, u8)>>;

/// One constant-tempo stretch of the tempo map.
#[derive(Debug, Clone, Copy)]
struct TempoSegment {
    tick: u64,
    seconds: f64,
    usec_per_beat: f64,
}

/// Converts absolute ticks to seconds.
#[derive(Debug)]
enum TickClock {
    Metrical {
        ticks_per_beat: f64,
        segments: Vec<TempoSegment>,
    },
    Timecode {
        seconds_per_tick: f64,
    },
}

impl TickClock {
    fn new(timing: Timing, tempo_changes: &[(u64, u32)]) -> Self {
        match timing {
            Timing::Metrical(tpb) => {
                let ticks_per_beat = tpb.as_int().max(1) as f64;
                let mut segments = vec![TempoSegment {
                    tick: 0,
                    seconds: 0.0,
                    usec_per_beat: DEFAULT_USEC_PER_BEAT,
                }];
                for &(tick, usec) in tempo_changes {
                    if usec == 0 {
                        continue;
                    }
                    let seconds = Self::seconds_in(&segments, ticks_per_beat, tick);
                    match segments.last_mut() {
                        Some(last) if last.tick == tick => last.usec_per_beat = usec as f64,
                        _ => segments.push(TempoSegment {
                            tick,
                            seconds,
                            usec_per_beat: usec as f64,
                        }),
                    }
                }
                TickClock::Metrical {
                    ticks_per_beat,
                    segments,
                }
            }
            Timing::Timecode(fps, subframes) => {
                let ticks_per_second = fps.as_f32() as f64 * subframes.max(1) as f64;
                TickClock::Timecode {
                    seconds_per_tick: 1.0 / ticks_per_second,
                }
            }
        }
    }

    fn seconds_in(segments: &[TempoSegment], ticks_per_beat: f64, tick: u64) -> f64 {
        let idx = segments.partition_point(|s| s.tick <= tick).saturating_sub(1);
        let seg = segments[idx];
        let beats = (tick - seg.tick) as f64 / ticks_per_beat;
        seg.seconds + beats * seg.usec_per_beat / 1_000_000.0
    }

    fn seconds_at(&self, tick: u64) -> f64 {
        match self {
            TickClock::Metrical {
                ticks_per_beat,
                segments,
            } => Self::seconds_in(segments, *ticks_per_beat, tick),
            TickClock::Timecode { seconds_per_tick } => tick as f64 * seconds_per_tick,
        }
    }
}

/// Parses a MIDI byte stream into a timeline.
///
/// The first tempo and time signature (in tick order) are kept on the
/// timeline. When absent, 120 BPM and 4/4 are used and a warning is logged.
///
/// # Errors
///
/// Returns [`PlayerError::Parse`] if the bytes are malformed or the file is
/// SMF Format 2.
pub fn parse_timeline(bytes: &[u8]) -> Result<Timeline> {
    let smf = Smf::parse(bytes).map_err(|e| PlayerError::Parse(e.to_string()))?;

    if smf.header.format == Format::Sequential {
        return Err(PlayerError::Parse(
            "Format 2 (sequential) MIDI files not supported".to_string(),
        ));
    }

    // Collect tempo and time signature changes from every track
    let mut tempo_changes: Vec<(u64, u32)> = Vec::new();
    let mut time_sigs: Vec<(u64, TimeSignature)> = Vec::new();
    for track in &smf.tracks {
        let mut tick: u64 = 0;
        for event in track {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Meta(meta) = event.kind {
                match meta {
                    MetaMessage::Tempo(usec) => tempo_changes.push((tick, usec.as_int())),
                    MetaMessage::TimeSignature(num, denom_power, _, _) => {
                        // denom_power is power of 2 (e.g., 2 means quarter note)
                        let subdivision = 1u8.checked_shl(denom_power as u32).unwrap_or(4);
                        time_sigs.push((
                            tick,
                            TimeSignature {
                                beats_per_measure: num.max(1),
                                subdivision,
                            },
                        ));
                    }
                    _ => {}
                }
            }
        }
    }
    // Stable sort keeps track order for events at the same tick
    tempo_changes.sort_by_key(|&(tick, _)| tick);
    time_sigs.sort_by_key(|&(tick, _)| tick);

    let clock = TickClock::new(smf.header.timing, &tempo_changes);

    let tempo_bpm = match tempo_changes.iter().find(|&&(_, usec)| usec > 0) {
        Some(&(_, usec)) => {
            let bpm = 60_000_000.0 / usec as f64;
            tracing::info!("Detected tempo from MIDI: {:.2} BPM", bpm);
            bpm
        }
        None => {
            tracing::warn!(
                "No tempo found in MIDI, using default {} BPM",
                DEFAULT_TEMPO
            );
            DEFAULT_TEMPO
        }
    };

    let time_signature = match time_sigs.first() {
        Some(&(_, ts)) => {
            tracing::info!(
                "Detected time signature from MIDI: {}/{}",
                ts.beats_per_measure,
                ts.subdivision
            );
            ts
        }
        None => {
            tracing::warn!("No time signature found in MIDI, using default 4/4");
            TimeSignature::default()
        }
    };

    let mut tracks = Vec::new();
    for (track_idx, track) in smf.tracks.iter().enumerate() {
        tracks.extend(parse_track(track, track_idx, &clock));
    }

    let timeline = Timeline::new(tracks, tempo_bpm, time_signature);
    tracing::debug!(
        "Parsed {} notes in {} tracks, {:.3}s total",
        timeline.note_count(),
        timeline.tracks().len(),
        timeline.total_end_seconds()
    );
    Ok(timeline)
}

/// Parses a single MIDI track into one [`Track`] per channel that has notes.
fn parse_track(track: &[TrackEvent], track_idx: usize, clock: &TickClock) -> Vec<Track> {
    let mut channel_tracks: HashMap<u8, Track> = HashMap::new();
    let mut active_notes: ActiveNotes = HashMap::new();
    let mut track_name: Option<String> = None;

    let mut current_tick: u64 = 0;

    let close_note = |channel_tracks: &mut HashMap<u8, Track>,
                          track_name: &Option<String>,
                          ch: u8,
                          pitch: u8,
                          start_tick: u64,
                          velocity: u8,
                          end_tick: u64| {
        if end_tick <= start_tick {
            return;
        }
        let start = clock.seconds_at(start_tick);
        let end = clock.seconds_at(end_tick);
        let track = channel_tracks.entry(ch).or_insert_with(|| {
            let name = track_name
                .clone()
                .unwrap_or_else(|| format!("Track {}", track_idx + 1));
            Track::new(name, ch)
        });
        track.add_note(NoteEvent::new(
            start,
            end - start,
            pitch,
            velocity as f32 / 127.0,
        ));
    };

    for event in track {
        current_tick += event.delta.as_int() as u64;

        match event.kind {
            TrackEventKind::Meta(MetaMessage::TrackName(name_bytes)) => {
                if let Ok(name) = std::str::from_utf8(name_bytes) {
                    track_name = Some(name.to_string());
                }
            }
            TrackEventKind::Midi { channel, message } => {
                let ch = channel.as_int();
                let (pitch, note_on_velocity) = match message {
                    MidiMessage::NoteOn { key, vel } => (key.as_int(), vel.as_int()),
                    MidiMessage::NoteOff { key, .. } => (key.as_int(), 0),
                    _ => continue, // Ignore other MIDI messages
                };

                if note_on_velocity > 0 {
                    active_notes
                        .entry((ch, pitch))
                        .or_default()
                        .push_back((current_tick, note_on_velocity));
                } else if let Some((start_tick, velocity)) = active_notes
                    .get_mut(&(ch, pitch))
                    .and_then(|queue| queue.pop_front())
                {
                    close_note(
                        &mut channel_tracks,
                        &track_name,
                        ch,
                        pitch,
                        start_tick,
                        velocity,
                        current_tick,
                    );
                }
            }
            _ => {} // Ignore SysEx and other events
        }
    }

    // Close notes left open at the end of the track
    for ((ch, pitch), queue) in active_notes {
        for (start_tick, velocity) in queue {
            close_note(
                &mut channel_tracks,
                &track_name,
                ch,
                pitch,
                start_tick,
                velocity,
                current_tick,
            );
        }
    }

    let mut tracks: Vec<Track> = channel_tracks.into_values().collect();
    tracks.sort_by_key(|t| t.channel);
    tracks
}
