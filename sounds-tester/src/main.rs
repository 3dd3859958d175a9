use anyhow::{Context, Result};
use clap::Parser;
use sounds::{EngineDesc, PlayRequest, PumpThread, SoundEngine, SoundEvent};
use std::time::{Duration, Instant};

/// Plays every file given on the command line through the default output,
/// each one three times over, and prints the engine state once per second.
///
/// Files shorter than `--preload-below` seconds are decoded up front; the rest
/// stream from disk.
fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let timeout = args
        .timeout
        .map(Duration::try_from_secs_f32)
        .transpose()
        .context("--timeout must be a positive number of seconds")?;
    let desc = EngineDesc::new().voice_count(args.voices);
    let mut engine =
        SoundEngine::with_default_output(desc).context("Failed to open the audio output")?;

    let mut assets = Vec::new();
    for path in &args.files {
        let id = engine
            .register_file(path)
            .with_context(|| format!("Failed to register {}", path))?;
        let short = engine
            .asset(id)?
            .duration()
            .is_some_and(|d| d.as_secs_f32() < args.preload_below);
        let id = if short {
            engine.unregister(id)?;
            engine.preload_file(path)?
        } else {
            id
        };
        log::info!("Loaded {} ({})", path, if short { "preloaded" } else { "streamed" });
        assets.push(id);
    }

    let events = engine.event_receiver();
    let pump = PumpThread::spawn(engine)?;

    for round in 0..3 {
        for (i, &asset) in assets.iter().enumerate() {
            let request = PlayRequest::new(asset).priority((round * assets.len() + i) as i32);
            match pump.engine().with(|engine| engine.request_play(request)) {
                Ok(handle) => log::info!("Playing {} as {}", args.files[i], handle),
                Err(e) => log::warn!("Could not play {}: {}", args.files[i], e),
            }
        }
    }

    let started = Instant::now();
    let mut last_report = Instant::now();
    loop {
        for event in events.try_iter() {
            match event {
                SoundEvent::VoiceFailed { handle, error } => {
                    log::error!("{} failed: {}", handle, error)
                }
                SoundEvent::Underrun { handle } => log::warn!("{} underrun", handle),
                other => log::debug!("{:?}", other),
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            let snapshot = pump.engine().lock().snapshot();
            log::info!("\n{}", snapshot);
            if snapshot.active_voices() == 0 {
                break;
            }
        }

        if timeout.is_some_and(|limit| started.elapsed() >= limit) {
            log::info!("Time limit reached, stopping");
            pump.engine().lock().stop_all();
            break;
        }
        std::thread::sleep(Duration::from_millis(40));
    }

    log::info!("Done after {:.1}s", started.elapsed().as_secs_f32());
    Ok(())
}

#[derive(Parser)]
#[command(name = "sounds-tester")]
#[command(about = "Plays audio files through the sounds engine and logs its state")]
#[command(version)]
struct Args {
    /// Hardware voices to mix
    #[arg(short, long, default_value_t = 4)]
    voices: usize,

    /// Decode files shorter than this many seconds up front
    #[arg(long, default_value_t = 2.0)]
    preload_below: f32,

    /// Stop every sound after this many seconds
    #[arg(long)]
    timeout: Option<f32>,

    /// Audio files to play
    #[arg(required = true)]
    files: Vec<String>,
}
