//! Offline rendering of a playback window to a WAV file.
//!
//! The window goes through the same scheduler as live playback. The only
//! difference is the clock: audio time advances as fast as chunks are
//! rendered instead of in real time.

use super::bus::{GainStage, OutputBus};
use super::clock::Clock;
use super::engine::{load_synthesizer, EngineGain, Mixer, SynthInstrument};
use super::instrument::{Instrument, InstrumentKind, InstrumentResolver};
use super::player::{CompletionStatus, Player};
use super::Backend;
use crate::config::PlaybackConfig;
use crate::midi::Timeline;
use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use std::sync::Arc;

/// Upper bound on frames rendered between two scheduler pumps.
const RENDER_BUFFER_SIZE: usize = 4096;

/// Silence rendered after the window so release tails are not cut.
const TAIL_SECONDS: f64 = 0.5;

/// Backend without an output device. Both clocks follow the render position.
struct OfflineBackend {
    mixer: Mixer,
}

impl Backend for OfflineBackend {
    fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.mixer.clock())
    }

    fn wall_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.mixer.clock())
    }

    fn output_gain(&self) -> Box<dyn GainStage> {
        Box::new(EngineGain::new(self.mixer.clone()))
    }

    fn create_instrument(&self, kind: InstrumentKind) -> crate::error::Result<Box<dyn Instrument>> {
        Ok(Box::new(SynthInstrument::new(self.mixer.clone(), kind)))
    }
}

/// Renders `[start_seconds, end_seconds)` of a timeline to a WAV file.
///
/// # Arguments
///
/// * `timeline` - The timeline to render
/// * `window` - Window bounds in timeline seconds
/// * `kind` - Instrument to render with
/// * `soundfont_path` - Path to the SoundFont file
/// * `output_path` - Path for the output WAV file
/// * `config` - Scheduler timing constants
/// * `progress_callback` - Optional callback for progress updates (0.0 to 1.0)
///
/// # Errors
///
/// Returns error if:
/// - SoundFont cannot be loaded
/// - Output file cannot be created
/// - The window cannot be scheduled
pub fn render_window_to_wav<P1, P2, F>(
    timeline: Arc<Timeline>,
    window: (f64, f64),
    kind: InstrumentKind,
    soundfont_path: P1,
    output_path: P2,
    config: PlaybackConfig,
    mut progress_callback: Option<F>,
) -> Result<()>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
    F: FnMut(f32),
{
    let (start_seconds, end_seconds) = window;
    let synth = load_synthesizer(soundfont_path)?;
    let mixer = Mixer::new(synth);
    let sample_rate = mixer.sample_rate();

    let backend: Arc<dyn Backend> = Arc::new(OfflineBackend {
        mixer: mixer.clone(),
    });
    let bus = OutputBus::new(backend.output_gain());
    let mut resolver = InstrumentResolver::new(Arc::clone(&backend), bus.clone());
    let instrument = resolver.resolve(kind)?;

    let mut player = Player::new(backend.clock(), backend.wall_clock(), bus, config);
    player.setup(timeline, instrument);
    let mut completion = player.play_window(start_seconds, end_seconds)?;

    let duration_seconds = (end_seconds - start_seconds).max(0.0) + TAIL_SECONDS;
    let total_frames = (duration_seconds * sample_rate as f64) as usize;

    // Chunks must not outrun the scheduler's lookahead
    let lookahead_frames = (config.lookahead * sample_rate as f64) as usize;
    let chunk = lookahead_frames.clamp(64, RENDER_BUFFER_SIZE);

    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(output_path.as_ref(), spec).with_context(|| {
        format!(
            "Failed to create output WAV file: {}",
            output_path.as_ref().display()
        )
    })?;

    let mut left_buf = vec![0.0f32; chunk];
    let mut right_buf = vec![0.0f32; chunk];
    let mut rendered = 0usize;

    while rendered < total_frames {
        player.pump();

        let frames = (total_frames - rendered).min(chunk);
        mixer.render(&mut left_buf[..frames], &mut right_buf[..frames]);

        // Write to WAV (interleaved stereo, 16-bit)
        for i in 0..frames {
            let left_sample = (left_buf[i] * 32767.0).clamp(-32768.0, 32767.0) as i16;
            let right_sample = (right_buf[i] * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(left_sample)?;
            writer.write_sample(right_sample)?;
        }
        rendered += frames;

        if let Some(ref mut callback) = progress_callback {
            callback(rendered as f32 / total_frames as f32);
        }
    }
    player.pump();

    writer.finalize().context("Failed to finalize WAV file")?;

    match completion.poll() {
        CompletionStatus::Done(outcome) => {
            tracing::info!("Rendered {} frames ({:?})", rendered, outcome)
        }
        status => tracing::warn!("Window still {:?} after rendering", status),
    }
    Ok(())
}
