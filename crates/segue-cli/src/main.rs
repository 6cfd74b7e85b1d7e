//! segue CLI - the `segue` command.
//!
//! Plays an endless, machine-generated melody: a generative oracle is kept
//! a few segments ahead of playback and every segment continues the last.
//!
//! # Commands
//!
//! - **play**: run the pipeline with the terminal console (or `--headless`)
//! - **generate**: one-shot generation of N chained segments into a MIDI file
//! - **init** / **config-path**: manage the configuration file

mod headless;
#[cfg(feature = "midi")]
mod midi_out;
mod output;
mod settings;
mod tui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use output::OutputOptions;
use segue_core::{build_oracle, generate_batch, write_midi, Harmony, OracleAdapter, TransportController};
use settings::Overrides;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// segue - continuous generated melody
#[derive(Parser, Debug)]
#[command(name = "segue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Plays a seamless, endlessly generated melody", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate and play continuously
    Play {
        #[command(flatten)]
        overrides: Overrides,

        /// No console: log status lines and stop on Ctrl+C
        #[arg(long)]
        headless: bool,

        /// Stop after this long (headless only, e.g. "30s")
        #[arg(long, value_parser = humantime::parse_duration, requires = "headless")]
        duration: Option<Duration>,

        /// Wait for space in the console instead of starting right away
        #[arg(long, conflicts_with = "headless")]
        paused: bool,

        /// Send notes to the MIDI output port whose name contains NAME
        #[arg(long, value_name = "NAME")]
        midi_port: Option<String>,

        /// MIDI channel (1-16)
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=16))]
        midi_channel: u8,

        /// Log every played note
        #[arg(long)]
        log_notes: bool,
    },

    /// Generate a fixed number of segments into a MIDI file
    Generate {
        #[command(flatten)]
        overrides: Overrides,

        /// Number of segments
        #[arg(short = 'n', long, default_value_t = 4)]
        segments: usize,

        /// Output file
        #[arg(short, long, value_name = "FILE", default_value = "segue.mid")]
        out: PathBuf,
    },

    /// Write a commented default configuration file
    Init {
        /// Where to write it (defaults to the user config file)
        #[arg(value_name = "FILE")]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the default configuration file location
    ConfigPath,

    /// List MIDI output ports
    #[cfg(feature = "midi")]
    Ports,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Play {
            overrides,
            headless,
            duration,
            paused,
            midi_port,
            midi_channel,
            log_notes,
        } => {
            if headless {
                tui::init_logger();
            } else {
                tui::init_tui_logger();
            }
            let outputs = OutputOptions {
                midi_port,
                midi_channel: midi_channel - 1,
                log_notes: log_notes || headless,
            };
            play(&overrides, &outputs, headless, duration, !paused)
        }
        Commands::Generate {
            overrides,
            segments,
            out,
        } => {
            tui::init_logger();
            generate(&overrides, segments, &out)
        }
        Commands::Init { path, force } => {
            let path = match path {
                Some(path) => path,
                None => settings::config_path()?,
            };
            settings::create_default_config_file(&path, force)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::ConfigPath => {
            println!("{}", settings::config_path()?.display());
            Ok(())
        }
        #[cfg(feature = "midi")]
        Commands::Ports => {
            for name in midi_out::list_ports()? {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn play(
    overrides: &Overrides,
    outputs: &OutputOptions,
    headless: bool,
    duration: Option<Duration>,
    autostart: bool,
) -> Result<()> {
    let config = overrides.load()?;
    let sink = output::build_sink(&config, outputs)?;
    let mut transport = TransportController::from_config(config, sink).context("Failed to start pipeline")?;

    let result = if headless {
        headless::run(&mut transport, duration)
    } else {
        tui::run(&mut transport, autostart)
    };

    // Joins the playback thread, which flushes the recorder.
    transport.shutdown();
    result
}

fn generate(overrides: &Overrides, segments: usize, out: &Path) -> Result<()> {
    let config = overrides.load()?;
    let adapter = OracleAdapter::new(build_oracle(&config.oracle.backend));
    log::info!(
        "Generating {} segment(s) of {} steps with '{}'",
        segments,
        config.model.step_count,
        adapter.name()
    );

    let mut generated = generate_batch(&adapter, &config, segments).context("Generation failed")?;
    if config.harmony.enabled {
        let harmony = Harmony::from_settings(&config.harmony).context("Invalid [harmony] settings")?;
        generated = harmony.fit_segments(&generated);
    }
    write_midi(&generated, config.playback.steps_per_second, out)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    let notes: usize = generated.iter().map(|s| s.notes().len()).sum();
    println!("Wrote {} segment(s), {} notes to {}", generated.len(), notes, out.display());
    Ok(())
}
