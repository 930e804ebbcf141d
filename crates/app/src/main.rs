use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use cpal::traits::{DeviceTrait, HostTrait};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use voxproc_core::{Session, SessionConfig};

mod audio;
mod config;
mod offline;
mod pcm;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "voxproc")]
#[command(about = "Real-time voice processing: echo cancellation, noise suppression, gain", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a recording (raw S16LE, or WAV by extension)
    Process {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Far-end (playback) recording aligned with the input
        #[arg(short, long)]
        reverse: Option<PathBuf>,
        /// call or message
        #[arg(long)]
        profile: Option<String>,
        /// standard or lite
        #[arg(long)]
        engine: Option<String>,
        /// Initial stream delay in ms
        #[arg(long)]
        delay: Option<i32>,
        #[arg(long, allow_hyphen_values = true)]
        gain_db: Option<i32>,
        #[arg(long)]
        manual_gain: bool,
        /// Samples per chunk handed to the session
        #[arg(long, default_value_t = 1024)]
        chunk: usize,
        /// Keep the stream delay fixed
        #[arg(long)]
        no_adjust: bool,
    },
    /// Run live in the foreground (press Ctrl+C to stop)
    Live {
        #[arg(short, long)]
        input: Option<String>,
        #[arg(short, long)]
        output: Option<String>,
        /// Capture device carrying the far-end signal (e.g. a speaker monitor)
        #[arg(short, long)]
        reference: Option<String>,
    },
    /// List available audio devices
    List,
    /// Print the saved configuration
    Config {
        /// Restore and save the defaults
        #[arg(long)]
        reset: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let saved = AppConfig::load();

    match cli.command {
        Commands::Process {
            input,
            output,
            reverse,
            profile,
            engine,
            delay,
            gain_db,
            manual_gain,
            chunk,
            no_adjust,
        } => {
            let profile = match profile {
                Some(name) => {
                    config::parse_profile(&name).ok_or_else(|| anyhow!("Unknown profile '{}'", name))?
                }
                None => saved.profile(),
            };
            let engine = match engine {
                Some(name) => {
                    config::parse_engine(&name).ok_or_else(|| anyhow!("Unknown engine '{}'", name))?
                }
                None => saved.engine_kind(),
            };
            let manual_gain = manual_gain || saved.manual_gain;
            let gain_db = gain_db.or(manual_gain.then_some(saved.gain_db));

            let report = offline::process_file(&offline::ProcessOptions {
                input,
                output,
                reverse,
                profile,
                engine,
                delay_ms: delay.unwrap_or(saved.initial_delay_ms),
                gain_db,
                manual_gain,
                chunk,
                auto_delay: saved.auto_delay && !no_adjust,
            })?;

            println!(
                "Processed {} samples: {} frames, {} reverse frames, {} delay step(s), final delay {}ms",
                report.samples,
                report.frames,
                report.reverse_frames,
                report.delay_moves,
                report.final_delay_ms
            );
            if let Some(poor) = report.last_poor_delays {
                println!("Last delay metrics: {}% poor delays", poor);
            }
            if let Some(voiced) = report.voice_chunks {
                println!("Voice detected in {} chunk(s)", voiced);
            }
        }
        Commands::Live {
            input,
            output,
            reference,
        } => {
            let input = input.unwrap_or_else(|| saved.last_input.clone());
            let output = output.unwrap_or_else(|| saved.last_output.clone());
            let reference = reference.or_else(|| saved.reference_device.clone());

            let config = SessionConfig::new(saved.profile(), saved.initial_delay_ms)
                .with_engine(saved.engine_kind());
            let mut session = Session::with_config(config).context("Failed to create session")?;
            session.set_gain(saved.gain_db, saved.manual_gain);

            let (stats_tx, stats_rx) = crossbeam_channel::bounded(4);
            let _engine = audio::AudioEngine::start(
                &input,
                &output,
                reference.as_deref(),
                session,
                saved.auto_delay,
                Some(stats_tx),
            )?;
            println!("voxproc active. Press Ctrl+C to stop.");

            // Graceful shutdown handling
            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();

            ctrlc::set_handler(move || {
                println!("\nShutting down gracefully...");
                r.store(false, Ordering::Relaxed);
            })?;

            while running.load(Ordering::Relaxed) {
                if let Ok(stats) = stats_rx.recv_timeout(Duration::from_millis(100)) {
                    log::info!(
                        "frames={} delay={}ms median={} poor={:?} voice={:?} level={}",
                        stats.frames,
                        stats.stream_delay_ms,
                        stats.metrics.median_ms,
                        stats.metrics.poor_delays_percent(),
                        stats.has_voice,
                        stats.suggested_analog_level
                    );
                }
            }

            let mut updated = saved.clone();
            updated.last_input = input;
            updated.last_output = output;
            updated.reference_device = reference;
            updated.save();

            println!("voxproc stopped.");
        }
        Commands::List => {
            list_devices()?;
        }
        Commands::Config { reset } => {
            let shown = if reset {
                let defaults = AppConfig::default();
                defaults.save();
                defaults
            } else {
                saved
            };
            if let Some(path) = config::config_path() {
                println!("# {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    println!("Audio Host: {}", host.id().name());
    println!("\nInput Devices:");
    for device in host.input_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    println!("\nOutput Devices:");
    for device in host.output_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    Ok(())
}
