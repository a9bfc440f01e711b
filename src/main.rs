//! rangeplay - Plays a window of a MIDI file through a SoundFont.
//!
//! # Usage
//!
//! ```bash
//! rangeplay song.mid --soundfont piano.sf2                 # whole file
//! rangeplay song.mid -sf piano.sf2 --from 2.5 --to 6       # seconds
//! rangeplay song.mid -sf piano.sf2 --measures 4:8          # measures
//! rangeplay song.mid -sf piano.sf2 --measures 4+2:8+1      # measures and beats
//! rangeplay song.mid -sf piano.sf2 --export out.wav        # render to WAV
//! ```
//!
//! Set `RUST_LOG=debug` for scheduler logs.

use anyhow::{bail, Context, Result};
use rangeplay::audio::render_window_to_wav;
use rangeplay::{
    CompletionStatus, InstrumentKind, Manager, PlayRequest, Settings, SetupOptions,
    SoundFontLoader, Timeline,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How often the scheduler is pumped during live playback.
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Command-line options for the application.
struct CliOptions {
    /// MIDI file to play.
    midi: PathBuf,
    /// Path to a SoundFont file. Overrides the settings file.
    soundfont: Option<PathBuf>,
    /// Window in seconds.
    from: Option<f64>,
    to: Option<f64>,
    /// Window in measures, as "A:B". Either side may add a beat offset,
    /// as in "4+1.5".
    measures: Option<((u32, f64), (u32, f64))>,
    instrument: Option<InstrumentKind>,
    /// JSON settings file.
    config: Option<PathBuf>,
    /// Render to this WAV file instead of playing.
    export: Option<PathBuf>,
    /// Ring the end bell after playback.
    bell: bool,
}

fn print_usage(program: &str) {
    eprintln!("rangeplay - Play a window of a MIDI file");
    eprintln!();
    eprintln!("Usage: {} <file.mid> [OPTIONS]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -sf, --soundfont PATH   SoundFont file (.sf2)");
    eprintln!("  --from SECS             Window start in seconds (default 0)");
    eprintln!("  --to SECS               Window end in seconds (default: end of file)");
    eprintln!("  --measures A:B          Window in measures, counted from 0, B exclusive");
    eprintln!("                          A beat offset may follow a measure, as in 4+1.5:8");
    eprintln!("  -i, --instrument NAME   synth or sampler");
    eprintln!("  -c, --config FILE       JSON settings file");
    eprintln!("  -o, --export OUT.wav    Render the window to a WAV file");
    eprintln!("  --bell                  Ring a bell when playback ends");
    eprintln!("  -h, --help              Print this help message");
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    eprintln!("Use --help for usage information");
    std::process::exit(1);
}

fn parse_seconds(flag: &str, value: &str) -> f64 {
    match value.parse::<f64>() {
        Ok(seconds) if seconds.is_finite() => seconds,
        _ => fail(format!("{} expects a number of seconds, got {:?}", flag, value)),
    }
}

/// Parses "M" or "M+BEAT".
fn parse_measure_beat(value: &str) -> Option<(u32, f64)> {
    let (measure, beat) = value.split_once('+').unwrap_or((value, "0"));
    let beat = beat.trim().parse::<f64>().ok().filter(|b| b.is_finite())?;
    Some((measure.trim().parse().ok()?, beat))
}

fn parse_measures(value: &str) -> ((u32, f64), (u32, f64)) {
    let parsed = value
        .split_once(':')
        .and_then(|(a, b)| Some((parse_measure_beat(a)?, parse_measure_beat(b)?)));
    match parsed {
        Some(range) => range,
        None => fail(format!("--measures expects A:B, got {:?}", value)),
    }
}

/// Returns the argument following the flag at `i`, advancing `i` past it.
fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> &'a str {
    *i += 1;
    match args.get(*i) {
        Some(value) => value.as_str(),
        None => fail(format!("{} requires an argument", flag)),
    }
}

impl CliOptions {
    /// Parses command-line arguments.
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let program = args.first().map(String::as_str).unwrap_or("rangeplay");

        let mut midi: Option<PathBuf> = None;
        let mut soundfont = None;
        let mut from = None;
        let mut to = None;
        let mut measures = None;
        let mut instrument = None;
        let mut config = None;
        let mut export = None;
        let mut bell = false;

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--soundfont" | "-sf" => {
                    soundfont = Some(PathBuf::from(next_value(&args, &mut i, flag)))
                }
                "--from" => from = Some(parse_seconds(flag, next_value(&args, &mut i, flag))),
                "--to" => to = Some(parse_seconds(flag, next_value(&args, &mut i, flag))),
                "--measures" | "-m" => {
                    measures = Some(parse_measures(next_value(&args, &mut i, flag)))
                }
                "--instrument" | "-i" => {
                    match next_value(&args, &mut i, flag).parse::<InstrumentKind>() {
                        Ok(kind) => instrument = Some(kind),
                        Err(e) => fail(e),
                    }
                }
                "--config" | "-c" => config = Some(PathBuf::from(next_value(&args, &mut i, flag))),
                "--export" | "-o" => export = Some(PathBuf::from(next_value(&args, &mut i, flag))),
                "--bell" => bell = true,
                "--help" | "-h" => {
                    print_usage(program);
                    std::process::exit(0);
                }
                other => {
                    if other.ends_with(".sf2") {
                        soundfont = Some(PathBuf::from(other));
                    } else if !other.starts_with('-') && midi.is_none() {
                        midi = Some(PathBuf::from(other));
                    } else {
                        fail(format!("Unknown option: {}", other));
                    }
                }
            }
            i += 1;
        }

        let Some(midi) = midi else {
            print_usage(program);
            std::process::exit(1);
        };
        if measures.is_some() && (from.is_some() || to.is_some()) {
            fail("--measures cannot be combined with --from/--to");
        }

        Self {
            midi,
            soundfont,
            from,
            to,
            measures,
            instrument,
            config,
            export,
            bell,
        }
    }

    fn request(&self) -> PlayRequest {
        if let Some((start, end)) = self.measures {
            return if start.1 == 0.0 && end.1 == 0.0 {
                PlayRequest::Measures {
                    start: start.0,
                    end: end.0,
                }
            } else {
                PlayRequest::MeasureBeats { start, end }
            };
        }
        match (self.from, self.to) {
            (None, None) => PlayRequest::All,
            (start, end) => PlayRequest::Window {
                start: start.unwrap_or(0.0),
                end: end.unwrap_or(f64::INFINITY),
            },
        }
    }
}

/// Resolves open-ended requests against the timeline.
fn resolve_request(request: PlayRequest, timeline: &Timeline) -> PlayRequest {
    match request {
        PlayRequest::Window { start, end } if end.is_infinite() => PlayRequest::Window {
            start,
            end: timeline.total_end_seconds(),
        },
        other => other,
    }
}

fn window_seconds(request: PlayRequest, timeline: &Timeline) -> (f64, f64) {
    match request {
        PlayRequest::All => (0.0, timeline.total_end_seconds()),
        PlayRequest::Window { start, end } => (start, end),
        PlayRequest::Measures { start, end } => timeline.measure_range_seconds(start, end),
        PlayRequest::MeasureBeats { start, end } => (
            timeline.measure_beat_seconds(start.0, start.1),
            timeline.measure_beat_seconds(end.0, end.1),
        ),
    }
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from_file(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(kind) = cli.instrument {
        settings.instrument = kind;
    }
    if cli.soundfont.is_some() {
        settings.soundfont = cli.soundfont.clone();
    }
    let Some(soundfont_path) = settings.soundfont.clone() else {
        bail!("No SoundFont given. Use --soundfont PATH or set \"soundfont\" in the config file");
    };

    let bytes = std::fs::read(&cli.midi)
        .with_context(|| format!("Failed to read MIDI file: {}", cli.midi.display()))?;

    if let Some(output_path) = &cli.export {
        let timeline = Arc::new(Timeline::from_midi(&bytes)?);
        let request = resolve_request(cli.request(), &timeline);
        let window = window_seconds(request, &timeline);
        eprintln!(
            "Rendering [{:.2}s, {:.2}s) to {}",
            window.0,
            window.1,
            output_path.display()
        );
        let mut last_decile = 0;
        render_window_to_wav(
            timeline,
            window,
            settings.instrument,
            &soundfont_path,
            output_path,
            settings.playback,
            Some(|progress: f32| {
                let decile = (progress * 10.0) as u32;
                if decile > last_decile {
                    last_decile = decile;
                    eprintln!("{}%", decile * 10);
                }
            }),
        )?;
        eprintln!("Exported to {}", output_path.display());
        return Ok(());
    }

    let mut manager = Manager::new(Box::new(SoundFontLoader::new(soundfont_path)));
    manager.setup(SetupOptions {
        on_play_start: Some(Box::new(|| tracing::info!("Playback started"))),
        on_play_end: Some(Box::new(|| tracing::info!("Playback ended"))),
        ..SetupOptions::from(&settings)
    })?;
    manager.load(&bytes)?;

    let timeline = manager
        .timeline()
        .cloned()
        .context("Timeline missing after load")?;
    let request = resolve_request(cli.request(), &timeline);
    let (start, end) = window_seconds(request, &timeline);
    eprintln!(
        "Playing {} [{:.2}s, {:.2}s) with the {} instrument",
        cli.midi.display(),
        start,
        end,
        settings.instrument
    );

    let mut completion = manager.play(request)?;
    let outcome = loop {
        manager.pump();
        match completion.poll() {
            CompletionStatus::Pending => std::thread::sleep(PUMP_INTERVAL),
            status => break status,
        }
    };
    tracing::debug!("Playback completed: {:?}", outcome);

    // The end cue runs ahead of the audio. Keep the stream alive until the
    // window has actually been heard.
    while !manager.is_drained() {
        std::thread::sleep(PUMP_INTERVAL);
    }

    if cli.bell {
        manager.play_bell("endBell1")?.wait();
    }
    Ok(())
}
