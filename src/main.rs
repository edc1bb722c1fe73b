use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use tokio::time::sleep;

use bagpipe_player::gpio::{self, BackendChoice};
use bagpipe_player::{
    load_config, ActuatorDriver, MidiFile, PlaybackEngine, PlaybackReport, PlayerConfig,
    RecordingSleeper, StopHandle, TimelineSource,
};

#[derive(Parser)]
#[command(author, version, about = "Play MIDI tracks on a GPIO bagpipe")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play one track of a MIDI file.
    Play(PlayArgs),
    /// List the tracks of a MIDI file.
    Tracks {
        file: PathBuf,
    },
    /// List MIDI output ports usable with `play --mirror-port`.
    Ports,
}

#[derive(Args)]
struct PlayArgs {
    file: PathBuf,
    /// Track index; track 0 is usually the conductor track.
    #[arg(long, default_value_t = 1)]
    track: usize,
    /// Channel map (JSON). Defaults to the built-in nine-hole layout.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Seconds to wait before the bellows start.
    #[arg(long, default_value_t = 3)]
    countdown: u64,
    /// Override the bellows warm-up from the config.
    #[arg(long)]
    warmup_ms: Option<u64>,
    /// Never touch hardware.
    #[arg(long)]
    simulate: bool,
    /// Simulate without sleeping and report how long the track would take.
    #[arg(long)]
    dry_run: bool,
    /// Mirror valve writes as MIDI notes to this output port instead of GPIO.
    #[arg(long)]
    mirror_port: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Play(args) => play(args).await,
        Commands::Tracks { file } => {
            let midi = MidiFile::open(&file)
                .with_context(|| format!("failed to load {}", file.display()))?;
            for (index, name) in midi.tracks() {
                println!("Track {index}: {name}");
            }
            Ok(())
        }
        Commands::Ports => {
            for (index, name) in gpio::mirror_ports()?.iter().enumerate() {
                println!("{index}: {name}");
            }
            Ok(())
        }
    }
}

async fn play(args: PlayArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => PlayerConfig::default(),
    };
    let channels = config.channel_map()?;
    let mut settings = config.engine_settings();
    if let Some(ms) = args.warmup_ms {
        settings.warmup = Duration::from_millis(ms);
    }

    // Both checks happen before any pin is claimed.
    let midi = MidiFile::open(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?;
    midi.load(args.track)
        .with_context(|| format!("cannot play {}", args.file.display()))?;

    let choice = if args.simulate || args.dry_run {
        BackendChoice::Simulate
    } else if let Some(port) = args.mirror_port {
        BackendChoice::MidiMirror(port)
    } else {
        BackendChoice::Auto
    };

    if args.countdown > 0 {
        println!("Starting playback in {} seconds...", args.countdown);
        tokio::select! {
            _ = sleep(Duration::from_secs(args.countdown)) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                return Ok(());
            }
        }
    }

    let stop = StopHandle::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Playback interrupted by user");
                stop.request_stop();
            }
        });
    }

    let track = args.track;
    let dry_run = args.dry_run;
    let player = tokio::task::spawn_blocking(move || -> Result<PlaybackReport> {
        let driver = ActuatorDriver::new(gpio::detect(choice), channels, config.master_supply_pin)?;
        let mut engine = PlaybackEngine::new(driver, settings).with_stop_handle(stop);
        if dry_run {
            engine = engine.with_sleeper(RecordingSleeper::new());
        }
        let report = engine.start(&midi, track);
        engine.cleanup();
        Ok(report?)
    });

    // A panic in the task has already shut the pins down while unwinding.
    let report = player.await.context("playback task failed")??;
    info!(
        "Played {} events ({} notes, {} unmapped, {} invalid tempos, {} actuator faults) over {:.3}s",
        report.events_dispatched,
        report.notes_played,
        report.unmapped_notes,
        report.invalid_tempos,
        report.actuator_faults,
        report.scheduled.as_secs_f64()
    );
    println!("Cleanup complete");
    Ok(())
}
